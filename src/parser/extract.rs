//! Extractors applied to individual tool inputs after parsing.

use super::{closes_fence, fence_run};

/// Path argument: the first `"quoted"` span on the first line of the tool
/// input, else the whole first line trimmed.
pub fn extract_path(input: &str) -> String {
    let first_line = input.lines().next().unwrap_or("").trim();

    if let Some(open) = first_line.find('"') {
        if let Some(close) = first_line[open + 1..].find('"') {
            return first_line[open + 1..open + 1 + close].to_string();
        }
    }

    first_line.to_string()
}

/// Content of the first fenced code block in the input.
///
/// Scans to the *last* bare closing fence of the same character with a run
/// length at least the opener's. Taking the last one is what keeps nested
/// blocks intact: a 4-backtick block holding 3-backtick blocks must close
/// at its own final fence, not at an inner one.
pub fn extract_code_block(input: &str) -> Option<String> {
    let lines: Vec<&str> = input.lines().collect();

    let (open_idx, open) = lines
        .iter()
        .enumerate()
        .find_map(|(i, line)| fence_run(line).map(|f| (i, f)))?;

    let close_idx = lines
        .iter()
        .enumerate()
        .skip(open_idx + 1)
        .filter(|(_, line)| closes_fence(line, open))
        .map(|(i, _)| i)
        .last()?;

    let content = lines[open_idx + 1..close_idx].join("\n");
    Some(content.trim_end().to_string())
}

/// The two labeled blocks of a find/replace input. Both are literal
/// 3-backtick blocks with `find` and `replace` info strings; both must be
/// present.
pub fn extract_find_replace(input: &str) -> Option<(String, String)> {
    let find = extract_labeled_block(input, "find")?;
    let replace = extract_labeled_block(input, "replace")?;
    Some((find, replace))
}

/// First ```<label> block, closed by the first subsequent bare ``` line.
fn extract_labeled_block(input: &str, label: &str) -> Option<String> {
    let opener = format!("```{label}");
    let lines: Vec<&str> = input.lines().collect();
    let start = lines.iter().position(|l| l.trim() == opener)?;

    let mut content: Vec<&str> = Vec::new();
    for line in &lines[start + 1..] {
        if line.trim() == "```" {
            return Some(content.join("\n"));
        }
        content.push(line);
    }

    None
}

/// Command input: the fenced block if there is one, else the raw input.
pub fn command_input(input: &str) -> String {
    extract_code_block(input).unwrap_or_else(|| input.trim().to_string())
}
