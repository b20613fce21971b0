//! Filesystem tools: directory listing (plain and glob), read, write, and
//! literal find/replace.
//!
//! All tool failures are returned as result strings, not errors; the loop
//! feeds them back to the model and lets it course-correct.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::parser::extract;

/// Inputs starting with `/` or `<letter>:` are absolute; everything else is
/// joined against the session working directory.
pub fn resolve_path(input: &str, working_dir: &Path) -> PathBuf {
    let trimmed = input.trim();
    let mut chars = trimmed.chars();
    let drive_prefixed = matches!(
        (chars.next(), chars.next()),
        (Some(c), Some(':')) if c.is_ascii_alphabetic()
    );

    if trimmed.starts_with('/') || drive_prefixed {
        PathBuf::from(trimmed)
    } else {
        working_dir.join(trimmed)
    }
}

/// Directory tree assembled from glob matches, rendered depth-first with
/// two-space indentation and a trailing `/` on directories.
#[derive(Default)]
struct TreeNode {
    children: BTreeMap<String, TreeNode>,
    is_dir: bool,
}

impl TreeNode {
    fn insert(&mut self, components: &[String], is_dir: bool) {
        let Some((first, rest)) = components.split_first() else {
            return;
        };
        let child = self.children.entry(first.clone()).or_default();
        if rest.is_empty() {
            child.is_dir |= is_dir;
        } else {
            child.is_dir = true;
            child.insert(rest, is_dir);
        }
    }

    fn render(&self, depth: usize, out: &mut String) {
        for (name, child) in &self.children {
            out.push_str(&"  ".repeat(depth));
            out.push_str(name);
            if child.is_dir {
                out.push('/');
            }
            out.push('\n');
            child.render(depth + 1, out);
        }
    }
}

fn render_glob_tree(matches: &[PathBuf], working_dir: &Path) -> String {
    let mut root = TreeNode::default();

    for path in matches {
        let display = path.strip_prefix(working_dir).unwrap_or(path);
        let components: Vec<String> = display
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        if components.is_empty() {
            continue;
        }
        root.insert(&components, path.is_dir());
    }

    let mut out = String::new();
    root.render(0, &mut out);
    out.trim_end().to_string()
}

pub fn list_directory(input: &str, working_dir: &Path) -> String {
    let arg = extract::extract_path(input);

    if arg.contains('*') {
        let pattern = resolve_path(&arg, working_dir);
        let pattern = pattern.to_string_lossy();
        debug!("Glob listing: {}", pattern);

        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => return format!("ERROR: Invalid glob pattern: {}", e),
        };

        let matches: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
        if matches.is_empty() {
            return "No matches found".to_string();
        }

        return render_glob_tree(&matches, working_dir);
    }

    let path = resolve_path(&arg, working_dir);
    if !path.exists() {
        return format!("Directory not found: {}", path.display());
    }
    if !path.is_dir() {
        return format!("Not a directory: {}", path.display());
    }

    let entries = match fs::read_dir(&path) {
        Ok(entries) => entries,
        Err(e) => return format!("Error reading directory: {}", e),
    };

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.path().is_dir() {
            dirs.push(format!("[DIR]  {}", name));
        } else {
            files.push(format!("[FILE] {}", name));
        }
    }
    dirs.sort();
    files.sort();

    if dirs.is_empty() && files.is_empty() {
        return "(empty directory)".to_string();
    }

    dirs.into_iter().chain(files).collect::<Vec<_>>().join("\n")
}

pub fn read_file(input: &str, working_dir: &Path) -> String {
    let path = resolve_path(&extract::extract_path(input), working_dir);

    match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            format!("File not found: {}", path.display())
        }
        Err(e) => format!("Error reading file: {}", e),
    }
}

pub fn write_file(input: &str, working_dir: &Path) -> String {
    let path = resolve_path(&extract::extract_path(input), working_dir);

    let Some(content) = extract::extract_code_block(input) else {
        return "ERROR: No code block found for WRITE_FILE".to_string();
    };

    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            return format!("Error writing file: {}", e);
        }
    }

    match fs::write(&path, content) {
        Ok(()) => format!("File written: {}", path.display()),
        Err(e) => format!("Error writing file: {}", e),
    }
}

pub fn find_and_replace(input: &str, working_dir: &Path) -> String {
    let path = resolve_path(&extract::extract_path(input), working_dir);

    let Some((find, replace)) = extract::extract_find_replace(input) else {
        return "ERROR: FIND_AND_REPLACE_IN_FILE requires ```find and ```replace code blocks"
            .to_string();
    };

    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return format!("File not found: {}", path.display());
        }
        Err(e) => return format!("Error reading file: {}", e),
    };

    if !content.contains(&find) {
        return format!("Pattern not found in file: {}", path.display());
    }

    // Literal, non-regex, all occurrences. Count first, then split/join.
    let count = content.matches(&find).count();
    let replaced = content.split(&find).collect::<Vec<_>>().join(&replace);

    match fs::write(&path, replaced) {
        Ok(()) => format!("Replaced {} occurrence(s) in: {}", count, path.display()),
        Err(e) => format!("Error writing file: {}", e),
    }
}
