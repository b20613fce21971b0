//! Parser for the Markdown response envelope.
//!
//! The model is required to answer with a `# Agent Response` block holding
//! `## Thoughts`, `## Task List`, and `## Tool Choice` / `## Tool Input`
//! pairs. Reasoning models tend to emit scratch text first, so parsing
//! starts at the *last* occurrence of the marker. Headers are recognized
//! line by line with explicit fence tracking, because tool inputs routinely
//! embed Markdown (including fenced blocks) inside fenced blocks, which a
//! naive fence-matching regex cannot survive.

pub mod extract;

use anyhow::{bail, Result};

use crate::session::{TaskItem, TaskStatus};

/// Line-start marker that opens the canonical response slice.
pub const RESPONSE_MARKER: &str = "# Agent Response";

/// The full set of tool names the agent understands.
pub const KNOWN_TOOLS: &[&str] = &[
    "LIST_DIRECTORY",
    "READ_FILE",
    "WRITE_FILE",
    "FIND_AND_REPLACE_IN_FILE",
    "COMMAND",
    "UPDATE_TASK_LIST",
    "ASK_USER",
    "DONE",
    "READ_BACKGROUND_PROCESS",
    "LIST_BACKGROUND_PROCESSES",
    "KILL_BACKGROUND_PROCESS",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub name: String,
    pub input: String,
}

#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub thoughts: String,
    pub task_list: Vec<TaskItem>,
    pub tools: Vec<ToolCall>,
    /// Canonical Markdown slice (from the final marker onward). This is
    /// what gets stored in history, never the raw stream.
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Thoughts,
    TaskList,
    ToolChoice,
    ToolInput,
}

/// An open fence: its character and the exact run length that opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fence {
    pub ch: char,
    pub len: usize,
}

/// A fence line is a run of three or more backticks or tildes at the line
/// start, optionally followed by an info string.
pub(crate) fn fence_run(line: &str) -> Option<Fence> {
    let first = line.chars().next()?;
    if first != '`' && first != '~' {
        return None;
    }
    let len = line.chars().take_while(|&c| c == first).count();
    if len < 3 {
        return None;
    }
    Some(Fence { ch: first, len })
}

/// A line closes an open fence only with the same character, a run length
/// at least the opener's, and nothing but fence characters after trimming.
/// Shorter inner fences (and fences with info strings) are content, which
/// lets a 4-backtick block carry 3-backtick blocks verbatim.
pub(crate) fn closes_fence(line: &str, open: Fence) -> bool {
    match fence_run(line) {
        Some(f) if f.ch == open.ch && f.len >= open.len => {
            line.trim().chars().all(|c| c == open.ch)
        }
        _ => false,
    }
}

/// Parse one task-list line of the form `[<c>] <text>`.
/// `x`/`X` → complete, `~` → in-progress, space → pending; anything else
/// means the line is ignored.
fn parse_task_line(line: &str) -> Option<TaskItem> {
    let trimmed = line.trim();
    let rest = trimmed.strip_prefix('[')?;
    let mut chars = rest.chars();
    let marker = chars.next()?;
    if chars.next()? != ']' {
        return None;
    }

    let status = match marker {
        'x' | 'X' => TaskStatus::Complete,
        '~' => TaskStatus::InProgress,
        ' ' => TaskStatus::Pending,
        _ => return None,
    };

    Some(TaskItem {
        status,
        text: chars.as_str().trim().to_string(),
    })
}

/// Push the pending tool, if it ever got a recognized name. Input gathered
/// without a name is discarded.
fn finalize_tool(name: &mut Option<String>, input: &mut Vec<&str>, tools: &mut Vec<ToolCall>) {
    if let Some(name) = name.take() {
        tools.push(ToolCall {
            name,
            input: input.join("\n").trim().to_string(),
        });
    }
    input.clear();
}

/// Byte offset of the last line-start occurrence of the response marker.
fn find_canonical_start(input: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    input
        .match_indices(RESPONSE_MARKER)
        .filter(|(i, _)| *i == 0 || bytes[i - 1] == b'\n')
        .map(|(i, _)| i)
        .last()
}

/// Parse the concatenated streamed response into thoughts, task list, and
/// an ordered tool sequence. Fails when the marker is absent or when no
/// tool call could be assembled.
pub fn parse_response(input: &str) -> Result<ParsedResponse> {
    let Some(start) = find_canonical_start(input) else {
        bail!("response is missing the '# Agent Response' marker");
    };
    let canonical = &input[start..];

    let mut thoughts_lines: Vec<&str> = Vec::new();
    let mut task_list: Vec<TaskItem> = Vec::new();
    let mut tools: Vec<ToolCall> = Vec::new();

    let mut section = Section::None;
    let mut fence: Option<Fence> = None;
    let mut pending_name: Option<String> = None;
    let mut pending_input: Vec<&str> = Vec::new();

    for line in canonical.lines() {
        let tool_header =
            line.starts_with("## Tool Choice") || line.starts_with("## Tool Input");

        if let Some(open) = fence {
            // Recovery pragma: a model that forgot to close an outer fence
            // before its next tool still gets its section boundary honored,
            // but only while we are collecting tool input.
            if section == Section::ToolInput && tool_header {
                fence = None;
                // fall through to header handling below
            } else {
                if closes_fence(line, open) {
                    fence = None;
                }
                match section {
                    Section::Thoughts => thoughts_lines.push(line),
                    Section::ToolInput => pending_input.push(line),
                    _ => {}
                }
                continue;
            }
        } else if let Some(f) = fence_run(line) {
            fence = Some(f);
            match section {
                Section::Thoughts => thoughts_lines.push(line),
                Section::ToolInput => pending_input.push(line),
                _ => {}
            }
            continue;
        }

        if line.starts_with("## ") {
            if line.starts_with("## Thoughts") {
                finalize_tool(&mut pending_name, &mut pending_input, &mut tools);
                section = Section::Thoughts;
            } else if line.starts_with("## Task List") {
                finalize_tool(&mut pending_name, &mut pending_input, &mut tools);
                section = Section::TaskList;
            } else if line.starts_with("## Tool Choice") {
                finalize_tool(&mut pending_name, &mut pending_input, &mut tools);
                section = Section::ToolChoice;
            } else if line.starts_with("## Tool Input") {
                section = Section::ToolInput;
            } else {
                // Unknown header terminates whatever was in flight.
                finalize_tool(&mut pending_name, &mut pending_input, &mut tools);
                section = Section::None;
            }
            continue;
        }

        match section {
            Section::Thoughts => thoughts_lines.push(line),
            Section::TaskList => {
                if let Some(item) = parse_task_line(line) {
                    task_list.push(item);
                }
            }
            Section::ToolChoice => {
                if pending_name.is_none() {
                    let candidate = line.trim().to_uppercase();
                    if KNOWN_TOOLS.contains(&candidate.as_str()) {
                        pending_name = Some(candidate);
                    }
                }
            }
            Section::ToolInput => pending_input.push(line),
            Section::None => {}
        }
    }

    finalize_tool(&mut pending_name, &mut pending_input, &mut tools);

    if tools.is_empty() {
        bail!("response declared no tool calls");
    }

    Ok(ParsedResponse {
        thoughts: thoughts_lines.join("\n").trim().to_string(),
        task_list,
        tools,
        raw: canonical.to_string(),
    })
}
