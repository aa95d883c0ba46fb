//! Path resolution rule: purely lexical, applied to container paths, exec
//! working directories, and file I/O paths alike. Physical symlink defenses
//! live in a separate layer (the host sandbox's held directory descriptor).

use crate::error::{Result, SandboxError};

/// Resolve `path` against workspace root `workdir` under the no-escape rule.
///
/// 1. Trim whitespace; empty is an error.
/// 2. Clean `workdir`; if it's empty, `.`, or `/`, fall back to
///    `default_workdir`.
/// 3. If `path` is absolute, clean it directly; otherwise clean
///    `join(workdir, path)`.
/// 4. The cleaned candidate must equal `workdir` or be a descendant of it
///    (prefix `workdir + "/"`), else "access denied: path outside workspace".
pub fn resolve(workdir: &str, path: &str, default_workdir: &str) -> Result<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::access_denied("path is required"));
    }

    let root = clean(workdir);
    let root = if root.is_empty() || root == "." || root == "/" {
        clean(default_workdir)
    } else {
        root
    };

    let candidate = if trimmed.starts_with('/') {
        clean(trimmed)
    } else {
        clean(&format!("{}/{}", root, trimmed))
    };

    if candidate == root || candidate.starts_with(&format!("{}/", root)) {
        Ok(candidate)
    } else {
        Err(SandboxError::access_denied(format!(
            "access denied: path outside workspace: {}",
            path
        )))
    }
}

/// Lexically clean a `/`-separated path: resolve `.`/`..` components without
/// touching the filesystem, collapse repeated slashes, and drop a trailing
/// slash (except for the root itself).
fn clean(path: &str) -> String {
    let is_absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();

    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if is_absolute {
                    stack.pop();
                } else if stack.last().map(|c| *c != "..").unwrap_or(false) {
                    stack.pop();
                } else {
                    stack.push("..");
                }
            }
            other => stack.push(other),
        }
    }

    let joined = stack.join("/");
    if is_absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}
