//! Independent audit pass triggered by `DONE`.
//!
//! A second agent with a read-only tool surface inspects the working
//! directory and delivers a PASS/FAIL verdict. It keeps its own message
//! history and never mutates the session's.

use tracing::{debug, info, warn};

use crate::agent::prompt;
use crate::llm::ModelClient;
use crate::parser::{self, extract};
use crate::session::{ChatMessage, Session};
use crate::tools::background::ProcessRegistry;
use crate::tools::{command, fs};

/// Hard cap on audit iterations. Exhausting it without a verdict FAILs the
/// audit: an auditor that cannot reach a conclusion must not wave work
/// through.
const MAX_AUDIT_ITERATIONS: usize = 20;

/// Commands the audit agent may run, matched as prefixes of the trimmed
/// command line.
const ALLOWED_COMMAND_PREFIXES: &[&str] = &[
    "cat ",
    "head ",
    "tail ",
    "ls",
    "dir",
    "tree",
    "git status",
    "git diff",
    "git log",
    "npm test",
    "npm run build",
    "type ",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditVerdict {
    Pass,
    Fail(String),
}

fn command_allowed(command: &str) -> bool {
    let trimmed = command.trim();
    ALLOWED_COMMAND_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
}

/// Verdict from a DONE input: PASS unless it mentions failure.
fn verdict_from_done(input: &str) -> AuditVerdict {
    if input.to_lowercase().contains("fail") {
        AuditVerdict::Fail(input.trim().to_string())
    } else {
        AuditVerdict::Pass
    }
}

/// Fallback scan for a verdict in an unparseable response.
fn verdict_from_raw(raw: &str) -> AuditVerdict {
    let lower = raw.to_lowercase();
    if lower.contains("overall: fail") {
        AuditVerdict::Fail(raw.trim().to_string())
    } else {
        // "overall: pass" or nothing conclusive: pass conservatively, the
        // way a reviewer without findings signs off.
        AuditVerdict::Pass
    }
}

async fn execute_audit_tool(
    name: &str,
    input: &str,
    session: &Session,
    registry: &ProcessRegistry,
    command_timeout: u64,
) -> String {
    match name {
        "LIST_DIRECTORY" => fs::list_directory(input, &session.working_directory),
        "READ_FILE" => fs::read_file(input, &session.working_directory),
        "COMMAND" => {
            let cmd = extract::command_input(input);
            if !command_allowed(&cmd) {
                return format!("ERROR: Command not allowed in audit mode: {}", cmd);
            }
            command::run_command(&cmd, &session.working_directory, command_timeout, registry).await
        }
        other => format!("ERROR: Tool not available in audit mode: {}", other),
    }
}

/// Run the audit over a completed session.
///
/// Transport or parse trouble never escalates: bad iterations are spent
/// from the iteration budget and exhaustion is a FAIL.
pub async fn run_audit(
    client: &dyn ModelClient,
    session: &Session,
    summary: &str,
    registry: &ProcessRegistry,
    command_timeout: u64,
) -> AuditVerdict {
    let mut history = vec![
        ChatMessage::system(prompt::audit_prompt(&session.working_directory)),
        ChatMessage::user(prompt::audit_request(
            &session.original_prompt,
            summary,
            &session.render_task_list(),
        )),
    ];

    info!("Starting audit of session {}", session.id);

    for iteration in 0..MAX_AUDIT_ITERATIONS {
        let raw = match client.stream_chat(&history, true).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Audit model call failed (iteration {}): {:#}", iteration, e);
                continue;
            }
        };

        let parsed = match parser::parse_response(&raw) {
            Ok(parsed) => parsed,
            Err(_) => {
                debug!("Unparseable audit response; scanning for a verdict");
                return verdict_from_raw(&raw);
            }
        };

        history.push(ChatMessage::assistant(parsed.raw.clone()));

        let mut results = Vec::new();
        for tool in &parsed.tools {
            if tool.name == "DONE" {
                return verdict_from_done(&tool.input);
            }

            let result = execute_audit_tool(
                &tool.name,
                &tool.input,
                session,
                registry,
                command_timeout,
            )
            .await;
            let halt = result.starts_with("ERROR");
            results.push(format!("[{}]: {}", tool.name, result));
            if halt {
                break;
            }
        }

        if !results.is_empty() {
            history.push(ChatMessage::user(format!(
                "Tool results:\n{}",
                results.join("\n")
            )));
        }
    }

    AuditVerdict::Fail(format!(
        "Audit did not reach a verdict within {} iterations",
        MAX_AUDIT_ITERATIONS
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedClient {
        responses: Mutex<VecDeque<String>>,
    }

    impl ScriptedClient {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn stream_chat(&self, _messages: &[ChatMessage], _silent: bool) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    fn session_in(dir: &TempDir) -> Session {
        Session::new(dir.path().to_path_buf(), "make it work".into())
    }

    fn envelope(tool: &str, input: &str) -> String {
        format!("# Agent Response\n\n## Tool Choice\n{tool}\n\n## Tool Input\n{input}\n")
    }

    #[test]
    fn command_allow_list() {
        assert!(command_allowed("cat notes.txt"));
        assert!(command_allowed("ls -la"));
        assert!(command_allowed("git status"));
        assert!(command_allowed("git diff --stat"));
        assert!(command_allowed("npm test"));
        assert!(command_allowed("  tree src"));

        assert!(!command_allowed("rm -rf /"));
        assert!(!command_allowed("git push"));
        assert!(!command_allowed("npm install leftpad"));
        assert!(!command_allowed("catalog"));
    }

    #[test]
    fn done_verdicts() {
        assert_eq!(verdict_from_done("Overall: PASS, solid"), AuditVerdict::Pass);
        assert!(matches!(
            verdict_from_done("Overall: FAIL\nmissing file"),
            AuditVerdict::Fail(_)
        ));
        // Case-insensitive substring, per contract.
        assert!(matches!(
            verdict_from_done("this Failed to impress"),
            AuditVerdict::Fail(_)
        ));
    }

    #[test]
    fn raw_scan_verdicts() {
        assert_eq!(verdict_from_raw("...\nOverall: Pass\n..."), AuditVerdict::Pass);
        assert!(matches!(
            verdict_from_raw("blah OVERALL: FAIL blah"),
            AuditVerdict::Fail(_)
        ));
        assert_eq!(verdict_from_raw("no verdict anywhere"), AuditVerdict::Pass);
    }

    #[tokio::test]
    async fn passes_on_done_without_fail() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedClient::new(&[&envelope("DONE", "Overall: PASS\nall good")]);
        let registry = ProcessRegistry::new();

        let verdict = run_audit(&client, &session_in(&dir), "did it", &registry, 10).await;
        assert_eq!(verdict, AuditVerdict::Pass);
    }

    #[tokio::test]
    async fn inspects_files_before_verdict() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("result.txt"), "expected output").unwrap();

        let client = ScriptedClient::new(&[
            &envelope("READ_FILE", "result.txt"),
            &envelope("DONE", "Overall: PASS"),
        ]);
        let registry = ProcessRegistry::new();

        let verdict = run_audit(&client, &session_in(&dir), "wrote result.txt", &registry, 10).await;
        assert_eq!(verdict, AuditVerdict::Pass);
    }

    #[tokio::test]
    async fn disallowed_command_is_refused_but_not_fatal() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedClient::new(&[
            &envelope("COMMAND", "rm -rf ."),
            &envelope("DONE", "Overall: FAIL\ncould not verify"),
        ]);
        let registry = ProcessRegistry::new();

        let verdict = run_audit(&client, &session_in(&dir), "s", &registry, 10).await;
        assert!(matches!(verdict, AuditVerdict::Fail(_)));
        // The refused command must not have executed.
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn write_tools_are_not_available() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedClient::new(&[
            &envelope("WRITE_FILE", "\"x.txt\"\n```\nnope\n```"),
            &envelope("DONE", "Overall: PASS"),
        ]);
        let registry = ProcessRegistry::new();

        let verdict = run_audit(&client, &session_in(&dir), "s", &registry, 10).await;
        assert_eq!(verdict, AuditVerdict::Pass);
        assert!(!dir.path().join("x.txt").exists());
    }

    #[tokio::test]
    async fn unparseable_response_scans_for_verdict() {
        let dir = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();

        let client = ScriptedClient::new(&["I checked everything.\nOverall: FAIL - no tests"]);
        let verdict = run_audit(&client, &session_in(&dir), "s", &registry, 10).await;
        assert!(matches!(verdict, AuditVerdict::Fail(_)));

        let client = ScriptedClient::new(&["looks plausible to me"]);
        let verdict = run_audit(&client, &session_in(&dir), "s", &registry, 10).await;
        assert_eq!(verdict, AuditVerdict::Pass);
    }

    #[tokio::test]
    async fn exhaustion_fails_conservatively() {
        let dir = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();

        // 20 iterations of listing, never a verdict.
        let listing = envelope("LIST_DIRECTORY", ".");
        let responses: Vec<&str> = (0..MAX_AUDIT_ITERATIONS).map(|_| listing.as_str()).collect();
        let client = ScriptedClient::new(&responses);

        let verdict = run_audit(&client, &session_in(&dir), "s", &registry, 10).await;
        assert!(matches!(verdict, AuditVerdict::Fail(_)));
    }
}
