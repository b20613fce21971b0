//! Session persistence.
//!
//! One JSON file per session under the sessions directory, keyed by UUID,
//! plus a single `directory-map.json` mapping absolute working directories
//! to their most recent session id. The file on disk is the single source
//! of truth between runs: every history-mutating operation rewrites it in
//! full.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Filename of the working-directory → session-id map.
pub const DIRECTORY_MAP_FILE: &str = "directory-map.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Uppercase tag used when serializing history for the compressor.
    pub fn tag(&self) -> &'static str {
        match self {
            Role::System => "SYSTEM",
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "complete")]
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub status: TaskStatus,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionRecord {
    pub timestamp: DateTime<Utc>,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub working_directory: PathBuf,
    pub original_prompt: String,
    #[serde(default)]
    pub task_list: Vec<TaskItem>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub total_tokens: usize,
    #[serde(default)]
    pub compressions: Vec<CompressionRecord>,
}

impl Session {
    pub fn new(working_directory: PathBuf, original_prompt: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            working_directory,
            original_prompt,
            task_list: Vec::new(),
            history: Vec::new(),
            total_tokens: 0,
            compressions: Vec::new(),
        }
    }

    /// Character-based token estimate for the full history.
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.history)
    }

    /// Guarantee that `history[0]` is a system message, prepending `prompt`
    /// if the history is empty or starts with something else.
    pub fn ensure_system_prompt(&mut self, prompt: &str) {
        let has_system = self
            .history
            .first()
            .map(|m| m.role == Role::System)
            .unwrap_or(false);

        if !has_system {
            self.history.insert(0, ChatMessage::system(prompt));
        }
    }

    /// Render the task list as checkbox lines for prompts and the audit.
    pub fn render_task_list(&self) -> String {
        self.task_list
            .iter()
            .map(|item| {
                let marker = match item.status {
                    TaskStatus::Pending => ' ',
                    TaskStatus::InProgress => '~',
                    TaskStatus::Complete => 'x',
                };
                format!("[{}] {}", marker, item.text)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Sum of content lengths divided by four, rounded up.
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    let chars: usize = messages.iter().map(|m| m.content.len()).sum();
    chars.div_ceil(4)
}

/// Validate that a session id is a well-formed UUID and return the
/// canonical lowercase hyphenated form.
///
/// Rejects path separators, `..`, and any non-UUID input so the id can be
/// used safely as a filename component.
pub fn validate_session_id(id: &str) -> Result<String> {
    Uuid::parse_str(id)
        .map(|u| u.to_string())
        .map_err(|_| anyhow::anyhow!("Invalid session id: must be a valid UUID"))
}

#[derive(Debug, Clone)]
pub struct SessionSearchResult {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub prompt: String,
    pub match_count: usize,
}

/// File-per-session store rooted at a sessions directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    pub fn new(sessions_dir: PathBuf) -> Self {
        Self { sessions_dir }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.json", id))
    }

    fn map_path(&self) -> PathBuf {
        self.sessions_dir.join(DIRECTORY_MAP_FILE)
    }

    /// Persist the session, bumping `updatedAt` and refreshing the
    /// directory map. The session file is rewritten in its entirety.
    pub fn save(&self, session: &mut Session) -> Result<()> {
        let id = validate_session_id(&session.id)?;
        fs::create_dir_all(&self.sessions_dir).with_context(|| {
            format!(
                "Cannot create sessions directory: {}",
                self.sessions_dir.display()
            )
        })?;

        session.updated_at = Utc::now();

        let path = self.session_path(&id);
        let content = serde_json::to_string_pretty(session)?;
        fs::write(&path, content)
            .with_context(|| format!("Cannot write session file: {}", path.display()))?;

        self.record_last_session(&session.working_directory, &id)?;
        Ok(())
    }

    /// Load a session by id. Malformed files read as absent.
    pub fn load(&self, id: &str) -> Result<Option<Session>> {
        let id = validate_session_id(id)?;
        let path = self.session_path(&id);

        if !path.exists() {
            return Ok(None);
        }

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Cannot read session file {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        match serde_json::from_str(&content) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!("Skipping malformed session file {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// All readable sessions, newest first by `updatedAt`.
    pub fn list(&self) -> Result<Vec<Session>> {
        if !self.sessions_dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();

        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            if path.file_name().map(|n| n == DIRECTORY_MAP_FILE).unwrap_or(false) {
                continue;
            }

            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_session_id(stem).is_err() {
                debug!("Skipping non-UUID session file: {}", path.display());
                continue;
            }

            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<Session>(&content) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    debug!("Skipping malformed session file {}: {}", path.display(), e);
                }
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Last session id recorded for a working directory, if any.
    pub fn last_session_for(&self, working_directory: &Path) -> Result<Option<String>> {
        let map = self.read_map();
        Ok(map
            .get(&working_directory.to_string_lossy().to_string())
            .cloned())
    }

    fn record_last_session(&self, working_directory: &Path, id: &str) -> Result<()> {
        let mut map = self.read_map();
        map.insert(working_directory.to_string_lossy().to_string(), id.to_string());

        let content = serde_json::to_string_pretty(&map)?;
        let path = self.map_path();
        fs::write(&path, content)
            .with_context(|| format!("Cannot write directory map: {}", path.display()))?;
        Ok(())
    }

    /// A missing or malformed map reads as empty.
    fn read_map(&self) -> BTreeMap<String, String> {
        let path = self.map_path();
        fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }

    /// Delete sessions whose `updatedAt` age exceeds `retention_days`.
    /// Returns the number of files deleted. A retention of 0 keeps forever.
    pub fn purge_expired(&self, retention_days: u32) -> Result<u32> {
        if retention_days == 0 || !self.sessions_dir.exists() {
            return Ok(0);
        }

        let cutoff = Utc::now() - chrono::Duration::seconds(i64::from(retention_days) * 86400);
        let mut deleted = 0u32;

        for entry in fs::read_dir(&self.sessions_dir)? {
            let Ok(entry) = entry else {
                continue;
            };
            let path = entry.path();

            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            if path.file_name().map(|n| n == DIRECTORY_MAP_FILE).unwrap_or(false) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_session_id(stem).is_err() {
                continue;
            }

            // Corrupt files are left alone rather than reaped.
            let Some(session) = fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<Session>(&c).ok())
            else {
                continue;
            };

            if session.updated_at < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(
                            "Purged expired session {} (updated {})",
                            session.id,
                            session.updated_at.format("%Y-%m-%d")
                        );
                        deleted += 1;
                    }
                    Err(e) => {
                        warn!("Failed to purge session file {}: {}", path.display(), e);
                    }
                }
            }
        }

        Ok(deleted)
    }

    /// Case-insensitive substring search across stored sessions, sorted by
    /// match count descending.
    pub fn search(&self, query: &str) -> Result<Vec<SessionSearchResult>> {
        let query_lower = query.to_lowercase();
        let mut results = Vec::new();

        for session in self.list()? {
            let mut count = 0usize;
            count += session
                .original_prompt
                .to_lowercase()
                .matches(&query_lower)
                .count();
            for msg in &session.history {
                count += msg.content.to_lowercase().matches(&query_lower).count();
            }

            if count > 0 {
                results.push(SessionSearchResult {
                    id: session.id.clone(),
                    updated_at: session.updated_at,
                    prompt: session.original_prompt.clone(),
                    match_count: count,
                });
            }
        }

        results.sort_by(|a, b| b.match_count.cmp(&a.match_count));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        (dir, store)
    }

    fn sample_session(dir: &Path) -> Session {
        let mut session = Session::new(dir.to_path_buf(), "build a widget".to_string());
        session.history.push(ChatMessage::system("sys"));
        session.history.push(ChatMessage::user("build a widget"));
        session
    }

    #[test]
    fn save_then_load_round_trips() {
        let (tmp, store) = store();
        let mut session = sample_session(tmp.path());
        session.task_list.push(TaskItem {
            status: TaskStatus::InProgress,
            text: "widget".to_string(),
        });

        store.save(&mut session).unwrap();
        let loaded = store.load(&session.id).unwrap().unwrap();

        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.original_prompt, "build a widget");
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(loaded.task_list[0].status, TaskStatus::InProgress);
    }

    #[test]
    fn session_json_uses_contract_field_names() {
        let (tmp, store) = store();
        let mut session = sample_session(tmp.path());
        store.save(&mut session).unwrap();

        let raw = fs::read_to_string(store.sessions_dir().join(format!("{}.json", session.id)))
            .unwrap();
        for key in [
            "\"id\"",
            "\"createdAt\"",
            "\"updatedAt\"",
            "\"workingDirectory\"",
            "\"originalPrompt\"",
            "\"taskList\"",
            "\"history\"",
            "\"totalTokens\"",
            "\"compressions\"",
        ] {
            assert!(raw.contains(key), "missing {key} in {raw}");
        }
    }

    #[test]
    fn load_of_malformed_file_returns_none() {
        let (tmp, store) = store();
        let mut session = sample_session(tmp.path());
        store.save(&mut session).unwrap();

        fs::write(
            store.sessions_dir().join(format!("{}.json", session.id)),
            "{ not json",
        )
        .unwrap();

        assert!(store.load(&session.id).unwrap().is_none());
    }

    #[test]
    fn load_rejects_non_uuid_ids() {
        let (_tmp, store) = store();
        assert!(store.load("../../etc/passwd").is_err());
        assert!(store.load("not-a-uuid").is_err());
    }

    #[test]
    fn list_sorts_newest_first_and_skips_map_and_garbage() {
        let (tmp, store) = store();

        let mut older = sample_session(tmp.path());
        store.save(&mut older).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut newer = sample_session(tmp.path());
        store.save(&mut newer).unwrap();

        // Garbage files that the listing must ignore.
        fs::write(store.sessions_dir().join("notes.json"), "keep").unwrap();
        let bogus = store
            .sessions_dir()
            .join(format!("{}.json", Uuid::new_v4()));
        fs::write(&bogus, "{ not json").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[1].id, older.id);
    }

    #[test]
    fn directory_map_tracks_last_saved_session() {
        let (tmp, store) = store();

        let mut first = sample_session(tmp.path());
        store.save(&mut first).unwrap();
        assert_eq!(
            store.last_session_for(tmp.path()).unwrap().as_deref(),
            Some(first.id.as_str())
        );

        let mut second = sample_session(tmp.path());
        store.save(&mut second).unwrap();
        assert_eq!(
            store.last_session_for(tmp.path()).unwrap().as_deref(),
            Some(second.id.as_str())
        );
    }

    #[test]
    fn purge_deletes_only_expired_sessions() {
        let (tmp, store) = store();

        let mut old = sample_session(tmp.path());
        store.save(&mut old).unwrap();
        // Backdate the persisted updatedAt past the retention window.
        let path = store.sessions_dir().join(format!("{}.json", old.id));
        let mut value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["updatedAt"] = serde_json::json!((Utc::now()
            - chrono::Duration::days(60))
        .to_rfc3339());
        fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();

        let mut fresh = sample_session(tmp.path());
        store.save(&mut fresh).unwrap();

        let deleted = store.purge_expired(30).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.load(&old.id).unwrap().is_none());
        assert!(store.load(&fresh.id).unwrap().is_some());
    }

    #[test]
    fn purge_with_zero_retention_is_noop() {
        let (tmp, store) = store();
        let mut session = sample_session(tmp.path());
        store.save(&mut session).unwrap();

        assert_eq!(store.purge_expired(0).unwrap(), 0);
        assert!(store.load(&session.id).unwrap().is_some());
    }

    #[test]
    fn search_counts_matches_across_history() {
        let (tmp, store) = store();
        let mut session = sample_session(tmp.path());
        session
            .history
            .push(ChatMessage::assistant("the widget spins; WIDGET done"));
        store.save(&mut session).unwrap();

        let results = store.search("widget").unwrap();
        assert_eq!(results.len(), 1);
        // prompt + user echo + two assistant mentions
        assert_eq!(results[0].match_count, 4);

        assert!(store.search("zebra").unwrap().is_empty());
    }

    #[test]
    fn estimate_rounds_up() {
        let msgs = vec![ChatMessage::user("abcde")]; // 5 chars -> 2 tokens
        assert_eq!(estimate_tokens(&msgs), 2);
        assert_eq!(estimate_tokens(&[]), 0);
    }

    #[test]
    fn ensure_system_prompt_prepends_once() {
        let mut session = Session::new(PathBuf::from("/tmp"), "p".into());
        session.history.push(ChatMessage::user("hello"));

        session.ensure_system_prompt("sys");
        assert_eq!(session.history[0].role, Role::System);
        assert_eq!(session.history.len(), 2);

        session.ensure_system_prompt("sys");
        assert_eq!(session.history.len(), 2);
    }

    #[test]
    fn render_task_list_uses_status_markers() {
        let mut session = Session::new(PathBuf::from("/tmp"), "p".into());
        session.task_list = vec![
            TaskItem {
                status: TaskStatus::Complete,
                text: "done".into(),
            },
            TaskItem {
                status: TaskStatus::InProgress,
                text: "doing".into(),
            },
            TaskItem {
                status: TaskStatus::Pending,
                text: "todo".into(),
            },
        ];

        assert_eq!(session.render_task_list(), "[x] done\n[~] doing\n[ ] todo");
    }
}
