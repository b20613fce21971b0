//! Tool execution layer.
//!
//! The dispatcher is a plain match over the parsed tool name. Every tool
//! returns a result string; strings starting with `ERROR` make the loop
//! stop executing the rest of the response's tools.

pub mod background;
pub mod command;
pub mod fs;

use std::path::PathBuf;

use tracing::debug;

use crate::parser::extract;
use background::ProcessRegistry;

/// Everything a tool needs from the surrounding session.
#[derive(Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub registry: ProcessRegistry,
    /// Seconds before COMMAND promotes to the background.
    pub command_timeout: u64,
    /// Automated runs have no TTY to ask on.
    pub automated: bool,
}

pub async fn dispatch(name: &str, input: &str, ctx: &ToolContext) -> String {
    debug!("Dispatching tool: {}", name);

    match name {
        "LIST_DIRECTORY" => fs::list_directory(input, &ctx.working_dir),
        "READ_FILE" => fs::read_file(input, &ctx.working_dir),
        "WRITE_FILE" => fs::write_file(input, &ctx.working_dir),
        "FIND_AND_REPLACE_IN_FILE" => fs::find_and_replace(input, &ctx.working_dir),
        "COMMAND" => {
            let command = extract::command_input(input);
            command::run_command(&command, &ctx.working_dir, ctx.command_timeout, &ctx.registry)
                .await
        }
        // The task list itself is replaced by the loop from the parsed
        // response; the tool only acknowledges.
        "UPDATE_TASK_LIST" => "Task list updated".to_string(),
        "ASK_USER" => ask_user(input, ctx.automated).await,
        // Normally intercepted by the loop before dispatch; defined for
        // completeness.
        "DONE" => {
            let summary = input.trim();
            if summary.is_empty() {
                "No summary provided".to_string()
            } else {
                summary.to_string()
            }
        }
        "READ_BACKGROUND_PROCESS" => ctx.registry.read(input.trim()),
        "LIST_BACKGROUND_PROCESSES" => ctx.registry.list(),
        "KILL_BACKGROUND_PROCESS" => ctx.registry.kill(input.trim()),
        other => format!("ERROR: Unknown tool: {}", other),
    }
}

async fn ask_user(question: &str, automated: bool) -> String {
    if automated {
        return "ERROR: ASK_USER is disabled in automated mode (-p)".to_string();
    }

    let question = question.trim().to_string();
    let answer = tokio::task::spawn_blocking(move || {
        println!("\n[Agent asks] {}", question);
        print!("> ");
        use std::io::Write;
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(_) => line.trim().to_string(),
            Err(_) => String::new(),
        }
    })
    .await
    .unwrap_or_default();

    if answer.is_empty() {
        "(no response)".to_string()
    } else {
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir, automated: bool) -> ToolContext {
        ToolContext {
            working_dir: dir.path().to_path_buf(),
            registry: ProcessRegistry::new(),
            command_timeout: 10,
            automated,
        }
    }

    #[tokio::test]
    async fn routes_write_then_read() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, true);

        let result = dispatch("WRITE_FILE", "\"x.txt\"\n```\npayload\n```", &ctx).await;
        assert!(result.starts_with("File written: "));

        let result = dispatch("READ_FILE", "x.txt", &ctx).await;
        assert_eq!(result, "payload");
    }

    #[tokio::test]
    async fn command_goes_through_extractor() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, true);

        let result = dispatch("COMMAND", "```sh\necho routed\n```", &ctx).await;
        assert_eq!(result.trim(), "routed");
    }

    #[tokio::test]
    async fn update_task_list_is_a_fixed_acknowledgement() {
        let dir = TempDir::new().unwrap();
        let result = dispatch("UPDATE_TASK_LIST", "[x] anything", &ctx(&dir, true)).await;
        assert_eq!(result, "Task list updated");
    }

    #[tokio::test]
    async fn ask_user_is_denied_in_automated_mode() {
        let dir = TempDir::new().unwrap();
        let result = dispatch("ASK_USER", "what now?", &ctx(&dir, true)).await;
        assert_eq!(result, "ERROR: ASK_USER is disabled in automated mode (-p)");
    }

    #[tokio::test]
    async fn done_echoes_summary() {
        let dir = TempDir::new().unwrap();
        assert_eq!(dispatch("DONE", " all set ", &ctx(&dir, true)).await, "all set");
        assert_eq!(
            dispatch("DONE", "", &ctx(&dir, true)).await,
            "No summary provided"
        );
    }

    #[tokio::test]
    async fn background_tools_hit_the_registry() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, true);

        assert_eq!(
            dispatch("LIST_BACKGROUND_PROCESSES", "", &ctx).await,
            "No background processes"
        );
        assert_eq!(
            dispatch("READ_BACKGROUND_PROCESS", "proc_1abcd", &ctx).await,
            "Process not found: proc_1abcd"
        );
        assert_eq!(
            dispatch("KILL_BACKGROUND_PROCESS", "proc_1abcd", &ctx).await,
            "Process not found: proc_1abcd"
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_string() {
        let dir = TempDir::new().unwrap();
        let result = dispatch("FROBNICATE", "x", &ctx(&dir, true)).await;
        assert_eq!(result, "ERROR: Unknown tool: FROBNICATE");
    }
}
