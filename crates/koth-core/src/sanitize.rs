//! Name and path sanitizers shared across the workspace.

use std::path::{Component, Path, PathBuf};

/// Lowercase a container name to `[a-z0-9_]` for environment variable use.
pub fn sanitize_container_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return "container".to_string();
    }

    let mapped: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    let trimmed = mapped.trim_matches('_');
    if trimmed.is_empty() {
        "container".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Lowercase an identifier to `[a-z0-9-_]` for filesystem use.
pub fn sanitize_identifier(value: &str) -> String {
    let clean = value.trim().to_lowercase();
    let mut out = String::with_capacity(clean.len());
    for c in clean.chars() {
        match c {
            'a'..='z' | '0'..='9' | '-' | '_' => out.push(c),
            ' ' | '/' | '\\' => out.push('-'),
            _ => {}
        }
    }
    out.trim_matches('-').to_string()
}

/// Normalize a user-supplied relative path, discarding any leading `..`,
/// `.` and `/` components. Returns an empty string when nothing remains.
pub fn sanitize_relative_path(relative: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in relative.trim().split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Whether `target` stays inside `base` after lexical normalization.
///
/// Both paths are normalized component-wise; no filesystem access happens
/// here, so callers serving real files should pair this with a
/// canonicalized comparison to also cover symlinks.
pub fn path_within_base(base: &Path, target: &Path) -> bool {
    let base = normalize(base);
    let target = normalize(target);
    target.starts_with(&base)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Flatten newlines so a log line stays a single SSE event.
pub fn sanitize_log_message(message: &str) -> String {
    message.replace(['\r', '\n'], " ")
}

/// Trim and cap script output echoed into job logs.
pub fn summarize_script_output(output: &str) -> String {
    const LIMIT: usize = 1024;

    let output = output.trim();
    if output.is_empty() {
        return "<no output>".to_string();
    }

    if output.len() > LIMIT {
        let mut end = LIMIT;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &output[..end])
    } else {
        output.to_string()
    }
}
