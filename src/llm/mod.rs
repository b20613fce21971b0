//! Chat-completions client.
//!
//! Speaks the OpenAI-compatible streaming protocol: one POST to
//! `<apiUrl>/chat/completions` with `stream: true`, consumed as
//! Server-Sent Events. The agent loop, auditor, and compressor all go
//! through the [`ModelClient`] trait so tests can substitute a scripted
//! client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::debug;

use crate::config::Config;
use crate::session::ChatMessage;

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Stream one completion and return the concatenated assistant content.
    /// `silent` suppresses the stderr spinner (compression, audit, and
    /// other ancillary calls).
    async fn stream_chat(&self, messages: &[ChatMessage], silent: bool) -> Result<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    delta: ChatDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP implementation of [`ModelClient`].
pub struct HttpModelClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl HttpModelClient {
    pub fn new(config: &Config) -> Result<Self> {
        Self::from_parts(&config.api_url, &config.api_key, &config.model)
    }

    pub fn from_parts(api_url: &str, api_key: &str, model: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn stream_chat(&self, messages: &[ChatMessage], silent: bool) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
        };

        let mut request = self.http.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        debug!("POST {} ({} messages)", url, messages.len());

        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Chat endpoint returned HTTP {}: {}",
                status,
                detail.chars().take(500).collect::<String>()
            );
        }

        let mut stream = response.bytes_stream();
        let mut buf = BytesMut::new();
        let mut content = String::new();
        let mut spinner = Spinner::new(silent);

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Error reading response stream")?;
            buf.extend_from_slice(&chunk);
            spinner.tick();

            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line = buf.split_to(pos + 1);
                let Ok(text) = std::str::from_utf8(&line) else {
                    continue;
                };
                let text = text.trim();

                let Some(payload) = text.strip_prefix("data: ") else {
                    continue;
                };
                if payload.trim() == "[DONE]" {
                    break 'outer;
                }

                match serde_json::from_str::<ChatChunk>(payload) {
                    Ok(event) => {
                        if let Some(delta) = event
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.as_deref())
                        {
                            content.push_str(delta);
                        }
                    }
                    Err(err) => {
                        debug!("Ignoring non-JSON SSE payload: {}", err);
                    }
                }
            }
        }

        spinner.finish();
        Ok(content)
    }
}

/// Minimal stderr activity indicator shown while the body streams.
struct Spinner {
    silent: bool,
    frame: usize,
}

const SPINNER_FRAMES: [char; 4] = ['|', '/', '-', '\\'];

impl Spinner {
    fn new(silent: bool) -> Self {
        Self { silent, frame: 0 }
    }

    fn tick(&mut self) {
        if self.silent {
            return;
        }
        let frame = SPINNER_FRAMES[self.frame % SPINNER_FRAMES.len()];
        self.frame += 1;
        eprint!("\r{} streaming...", frame);
        let _ = std::io::stderr().flush();
    }

    fn finish(&mut self) {
        if self.silent || self.frame == 0 {
            return;
        }
        eprint!("\r                \r");
        let _ = std::io::stderr().flush();
    }
}
