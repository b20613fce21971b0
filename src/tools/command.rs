//! Shell command execution with timeout-driven background promotion.
//!
//! Commands run through the platform shell in the session's working
//! directory with the inherited environment. A command that outlives the
//! configured timeout is never cancelled: it is handed to the
//! [`ProcessRegistry`](super::background::ProcessRegistry) and keeps
//! running, with its output still being captured.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::debug;

use super::background::ProcessRegistry;

fn shell_invocation() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd.exe", "/c")
    } else {
        ("/bin/sh", "-c")
    }
}

/// Copy a pipe into the shared combined buffer until EOF.
fn pump<R>(mut reader: R, sink: Arc<Mutex<String>>) -> JoinHandle<()>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if let Ok(mut sink) = sink.lock() {
                        sink.push_str(&chunk);
                    }
                }
            }
        }
    })
}

/// Run `command` and return its result string.
///
/// Exactly one resolution happens per invocation: either the process exits
/// within `timeout_secs` (normal result) or the timeout fires first and the
/// process is promoted. The `select!` makes the race single-winner by
/// construction.
pub async fn run_command(
    command: &str,
    working_dir: &Path,
    timeout_secs: u64,
    registry: &ProcessRegistry,
) -> String {
    let (shell, flag) = shell_invocation();

    let mut child = match tokio::process::Command::new(shell)
        .arg(flag)
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return format!("Error: {}", e),
    };

    debug!("Running command (timeout {}s): {}", timeout_secs, command);

    let output = Arc::new(Mutex::new(String::new()));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(pump(stdout, Arc::clone(&output)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(pump(stderr, Arc::clone(&output)));
    }

    tokio::select! {
        status = child.wait() => {
            let status = match status {
                Ok(status) => status,
                Err(e) => return format!("Error: {}", e),
            };

            // Pipes close when the process exits; drain the readers fully
            // before snapshotting.
            for reader in readers {
                let _ = reader.await;
            }

            let captured = output
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default();

            if status.success() {
                if captured.is_empty() {
                    "(no output)".to_string()
                } else {
                    captured
                }
            } else {
                format!("Exit code {}\n{}", status.code().unwrap_or(-1), captured)
            }
        }
        _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
            let id = registry.promote(command, child, Arc::clone(&output), readers);
            format!("Command timed out after {}s. Backgrounded as: {}", timeout_secs, id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn run(command: &str, timeout_secs: u64) -> (String, ProcessRegistry, TempDir) {
        let dir = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();
        let result = run_command(command, dir.path(), timeout_secs, &registry).await;
        (result, registry, dir)
    }

    #[tokio::test]
    async fn captures_stdout() {
        let (result, _registry, _dir) = run("echo hello", 10).await;
        assert_eq!(result.trim(), "hello");
    }

    #[tokio::test]
    async fn empty_output_is_reported() {
        let (result, _registry, _dir) = run("true", 10).await;
        assert_eq!(result, "(no output)");
    }

    #[tokio::test]
    async fn nonzero_exit_includes_code_and_output() {
        let (result, _registry, _dir) = run("echo oops >&2; exit 1", 10).await;
        assert!(result.starts_with("Exit code 1"), "got: {result}");
        assert!(result.contains("oops"));
    }

    #[tokio::test]
    async fn stderr_is_combined_with_stdout() {
        let (result, _registry, _dir) = run("echo out; echo err >&2", 10).await;
        assert!(result.contains("out"));
        assert!(result.contains("err"));
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("here.txt"), "x").unwrap();
        let registry = ProcessRegistry::new();

        let result = run_command("ls", dir.path(), 10, &registry).await;
        assert!(result.contains("here.txt"));
    }

    #[tokio::test]
    async fn timeout_promotes_to_background() {
        let (result, registry, _dir) = run("sleep 30", 1).await;
        assert!(
            result.contains("Command timed out after 1s. Backgrounded as: proc_"),
            "got: {result}"
        );

        let id = result.rsplit(' ').next().unwrap().to_string();
        assert!(registry.contains(&id));
        assert!(registry.list().contains(&id));
        assert!(registry.read(&id).contains("Running"));

        // Clean up the stray sleep.
        registry.kill(&id);
    }

    #[tokio::test]
    async fn promoted_process_keeps_accumulating_output() {
        let (result, registry, _dir) =
            run("echo early; sleep 2; echo late", 1).await;
        let id = result.rsplit(' ').next().unwrap().to_string();

        // Early output is already visible while the process runs.
        assert!(registry.read(&id).contains("early"));

        for _ in 0..100 {
            if registry.exit_code(&id).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let snapshot = registry.read(&id);
        assert!(snapshot.contains("late"), "got: {snapshot}");
        assert!(snapshot.contains("Exited (0)"));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_string() {
        let registry = ProcessRegistry::new();
        let result = run_command(
            "true",
            Path::new("/nonexistent/working/dir"),
            10,
            &registry,
        )
        .await;
        assert!(result.starts_with("Error: "), "got: {result}");
    }
}
