//! History compression.
//!
//! Destructive by design: the pre-compression history is not retained. The
//! caller passes its current system prompt so the replacement history
//! reinstates an up-to-date one rather than whatever the session started
//! with.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::agent::prompt;
use crate::llm::ModelClient;
use crate::session::{ChatMessage, CompressionRecord, Session};

/// Serialize the history the way the compression assistant receives it.
fn serialize_history(history: &[ChatMessage]) -> String {
    history
        .iter()
        .map(|m| format!("[{}]\n{}", m.role.tag(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Summarize the history and replace it with exactly two messages: the
/// caller's system prompt and one user message carrying the summary plus
/// the preserved original prompt.
pub async fn compress_history(
    client: &dyn ModelClient,
    session: &mut Session,
    system_prompt: &str,
) -> Result<()> {
    let tokens_before = session.estimated_tokens();

    let request = vec![
        ChatMessage::system(prompt::COMPRESSION_PROMPT),
        ChatMessage::user(serialize_history(&session.history)),
    ];

    let summary = client
        .stream_chat(&request, true)
        .await
        .context("History compression request failed")?;

    session.history = vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(format!(
            "[CONTEXT SUMMARY]\n\n{}\n\n[ORIGINAL REQUEST]\n\n{}",
            summary.trim(),
            session.original_prompt
        )),
    ];

    let tokens_after = session.estimated_tokens();
    session.compressions.push(CompressionRecord {
        timestamp: Utc::now(),
        tokens_before,
        tokens_after,
    });

    info!(
        "Compressed history: {} -> {} estimated tokens",
        tokens_before, tokens_after
    );

    Ok(())
}
