//! Registry of commands promoted to the background after a timeout.
//!
//! Entries live only in process memory; nothing here is persisted across
//! invocations. Output keeps accumulating through the reader tasks spawned
//! at command launch, and the watcher task that owns the child handle is
//! the single writer of the exit code.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

struct BackgroundEntry {
    command: String,
    output: Arc<Mutex<String>>,
    exit_code: Option<i32>,
    started_at: Instant,
    kill: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, BackgroundEntry>,
    counter: u64,
}

/// Process-local table of promoted commands, shared between the agent loop
/// and the per-process watcher tasks.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_base36(mut n: u128) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        let d = (n % 36) as u32;
        digits.push(char::from_digit(d, 36).unwrap_or('0'));
        n /= 36;
    }
    digits.iter().rev().collect()
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a background id: `proc_` + base36 counter + the last four
    /// characters of the base36 unix-milliseconds timestamp.
    fn next_id(inner: &mut RegistryInner) -> String {
        inner.counter += 1;
        let counter = to_base36(u128::from(inner.counter));
        let millis = to_base36(Utc::now().timestamp_millis().max(0) as u128);
        let suffix = &millis[millis.len().saturating_sub(4)..];
        format!("proc_{}{}", counter, suffix)
    }

    /// Take ownership of a timed-out child: register it, keep its output
    /// buffer accumulating, and spawn the watcher that records the exit
    /// code (or kills on request). Returns the allocated id.
    pub fn promote(
        &self,
        command: &str,
        mut child: Child,
        output: Arc<Mutex<String>>,
        readers: Vec<JoinHandle<()>>,
    ) -> String {
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let id = {
            let mut inner = lock(&self.inner);
            let id = Self::next_id(&mut inner);
            inner.entries.insert(
                id.clone(),
                BackgroundEntry {
                    command: command.to_string(),
                    output: Arc::clone(&output),
                    exit_code: None,
                    started_at: Instant::now(),
                    kill: Some(kill_tx),
                },
            );
            id
        };

        debug!("Promoted command to background: {}", id);

        let registry = self.clone();
        let entry_id = id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            // Let the readers drain whatever is left in the pipes.
            for reader in readers {
                let _ = reader.await;
            }

            let code = status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);
            let mut inner = lock(&registry.inner);
            if let Some(entry) = inner.entries.get_mut(&entry_id) {
                entry.exit_code = Some(code);
                entry.kill = None;
            }
            debug!("Background process {} exited with code {}", entry_id, code);
        });

        id
    }

    pub fn read(&self, id: &str) -> String {
        let inner = lock(&self.inner);
        let Some(entry) = inner.entries.get(id) else {
            return format!("Process not found: {}", id);
        };

        let status = match entry.exit_code {
            Some(code) => format!("Exited ({})", code),
            None => "Running".to_string(),
        };

        let output = lock(&entry.output);
        let body = if output.is_empty() {
            "(no output yet)"
        } else {
            output.as_str()
        };

        format!("[{}] {}\nCommand: {}\n\n{}", id, status, entry.command, body)
    }

    pub fn list(&self) -> String {
        let inner = lock(&self.inner);
        if inner.entries.is_empty() {
            return "No background processes".to_string();
        }

        let mut entries: Vec<(&String, &BackgroundEntry)> = inner.entries.iter().collect();
        entries.sort_by_key(|(_, e)| e.started_at);

        entries
            .iter()
            .map(|(id, entry)| {
                let status = match entry.exit_code {
                    Some(code) => format!("Exited ({})", code),
                    None => "Running".to_string(),
                };
                let age = entry.started_at.elapsed().as_secs();
                let command = if entry.command.chars().count() > 50 {
                    let head: String = entry.command.chars().take(50).collect();
                    format!("{}...", head)
                } else {
                    entry.command.clone()
                };
                format!("{}: {} ({}s) - {}", id, status, age, command)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn kill(&self, id: &str) -> String {
        let mut inner = lock(&self.inner);
        let Some(entry) = inner.entries.get_mut(id) else {
            return format!("Process not found: {}", id);
        };

        if let Some(code) = entry.exit_code {
            return format!("Process already exited with code {}", code);
        }

        match entry.kill.take() {
            Some(sender) => match sender.send(()) {
                Ok(()) => format!("Process {} killed", id),
                Err(()) => format!("Failed to kill process: {} already shut down", id),
            },
            None => format!("Failed to kill process: no handle for {}", id),
        }
    }

    /// Whether an entry exists (test support).
    pub fn contains(&self, id: &str) -> bool {
        lock(&self.inner).entries.contains_key(id)
    }

    /// Exit code snapshot (test support).
    pub fn exit_code(&self, id: &str) -> Option<i32> {
        lock(&self.inner).entries.get(id).and_then(|e| e.exit_code)
    }
}
