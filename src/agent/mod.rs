//! The agent control loop.
//!
//! One iteration is: compress if the history estimate crossed the ceiling,
//! stream a completion, parse it, execute the declared tools in order, and
//! feed the results back. `DONE` hands off to the auditor; a PASS ends the
//! run. The loop owns the live session and persists it after every
//! mutation, so the file on disk always mirrors memory.

pub mod audit;
pub mod compress;
pub mod prompt;

use anyhow::{bail, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::llm::ModelClient;
use crate::parser;
use crate::session::{ChatMessage, Session, SessionStore};
use crate::tools::{self, background::ProcessRegistry, ToolContext};
use audit::AuditVerdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Interactive,
    Automated,
}

/// Result of a completed run (audit PASS).
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: String,
    pub loops: u32,
}

enum TurnOutcome {
    Continue,
    Done(String),
}

pub struct AgentLoop<'a> {
    config: &'a Config,
    client: &'a dyn ModelClient,
    store: &'a SessionStore,
    registry: ProcessRegistry,
    mode: Mode,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        config: &'a Config,
        client: &'a dyn ModelClient,
        store: &'a SessionStore,
        mode: Mode,
    ) -> Self {
        Self {
            config,
            client,
            store,
            registry: ProcessRegistry::new(),
            mode,
        }
    }

    /// Registry accessor so interactive callers can share one registry
    /// across consecutive runs in the same process.
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Drive the session to completion.
    ///
    /// Fatal conditions (retry budget exhausted, loop cap) surface as
    /// errors; everything else is absorbed into the conversation.
    pub async fn run(&self, session: &mut Session) -> Result<RunReport> {
        let system_prompt = prompt::system_prompt(self.mode, &session.working_directory);
        session.ensure_system_prompt(&system_prompt);
        self.store.save(session)?;

        let max_retries = match self.mode {
            Mode::Automated => self.config.max_retries_automated,
            Mode::Interactive => self.config.max_retries,
        };

        let mut retries: u32 = 0;
        let mut loops: u32 = 0;

        loop {
            if session.estimated_tokens() >= self.config.max_context_tokens {
                info!(
                    "History estimate {} >= ceiling {}; compressing",
                    session.estimated_tokens(),
                    self.config.max_context_tokens
                );
                compress::compress_history(self.client, session, &system_prompt).await?;
                self.store.save(session)?;
            }

            match self
                .turn(session, &mut retries, max_retries)
                .await?
            {
                TurnOutcome::Done(summary) => {
                    info!("Model declared completion; auditing");
                    let verdict = audit::run_audit(
                        self.client,
                        session,
                        &summary,
                        &self.registry,
                        self.config.command_timeout,
                    )
                    .await;

                    match verdict {
                        AuditVerdict::Pass => {
                            info!("Audit PASS after {} loop(s)", loops + 1);
                            return Ok(RunReport {
                                summary,
                                loops: loops + 1,
                            });
                        }
                        AuditVerdict::Fail(feedback) => {
                            warn!("Audit FAIL; feeding findings back");
                            session.history.push(ChatMessage::user(format!(
                                "AUDIT FAILED. Please address the following issues:\n\n{}",
                                feedback
                            )));
                            self.store.save(session)?;
                        }
                    }
                }
                TurnOutcome::Continue => {}
            }

            loops += 1;
            if loops >= self.config.max_loops {
                bail!(
                    "Agent exceeded the loop cap ({} iterations) without completing",
                    self.config.max_loops
                );
            }
        }
    }

    /// One model call plus the resulting tool executions.
    async fn turn(
        &self,
        session: &mut Session,
        retries: &mut u32,
        max_retries: u32,
    ) -> Result<TurnOutcome> {
        let silent = false;
        let raw = match self.client.stream_chat(&session.history, silent).await {
            Ok(raw) => raw,
            Err(e) => {
                *retries += 1;
                warn!("Model call failed ({}/{}): {:#}", retries, max_retries, e);
                if *retries >= max_retries {
                    bail!(
                        "Model request failed {} consecutive time(s); giving up: {:#}",
                        retries,
                        e
                    );
                }
                return Ok(TurnOutcome::Continue);
            }
        };

        session.total_tokens += raw.len().div_ceil(4);

        let parsed = match parser::parse_response(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                *retries += 1;
                warn!(
                    "Malformed model response ({}/{}): {:#}",
                    retries, max_retries, e
                );
                // Keep the raw stream so the corrective exchange stays
                // replayable, then tell the model what went wrong.
                session.history.push(ChatMessage::assistant(raw));
                session
                    .history
                    .push(ChatMessage::user(prompt::FORMAT_REMINDER));
                self.store.save(session)?;

                if *retries >= max_retries {
                    bail!(
                        "Model produced {} consecutive malformed response(s); giving up",
                        retries
                    );
                }
                return Ok(TurnOutcome::Continue);
            }
        };

        *retries = 0;

        // The model-reported task list is authoritative for display and
        // session metadata.
        session.task_list = parsed.task_list.clone();
        session
            .history
            .push(ChatMessage::assistant(parsed.raw.clone()));
        self.store.save(session)?;

        let ctx = ToolContext {
            working_dir: session.working_directory.clone(),
            registry: self.registry.clone(),
            command_timeout: self.config.command_timeout,
            automated: self.mode == Mode::Automated,
        };

        let mut results: Vec<String> = Vec::new();
        let mut done_summary: Option<String> = None;

        for tool in &parsed.tools {
            // DONE is terminal within a response: anything after it was
            // declared by a model that already claimed completion.
            if tool.name == "DONE" {
                let summary = tool.input.trim();
                done_summary = Some(if summary.is_empty() {
                    "No summary provided".to_string()
                } else {
                    summary.to_string()
                });
                break;
            }

            debug!("Executing tool {}", tool.name);
            let result = tools::dispatch(&tool.name, &tool.input, &ctx).await;
            let halt = result.starts_with("ERROR");
            results.push(format!("[{}]: {}", tool.name, result));

            if halt {
                debug!("Halting tool execution on ERROR result");
                break;
            }
        }

        if !results.is_empty() {
            session.history.push(ChatMessage::user(format!(
                "Tool results:\n{}",
                results.join("\n")
            )));
            self.store.save(session)?;
        }

        Ok(match done_summary {
            Some(summary) => TurnOutcome::Done(summary),
            None => TurnOutcome::Continue,
        })
    }
}
