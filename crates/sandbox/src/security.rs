//! Security pre-flight, applied before any container creation: bind-mount
//! validation, network/profile rejection, and environment sanitization.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::config::BindMount;
use crate::error::{Result, SandboxError};

/// Host paths (and their `/private` shadow on macOS) that may never be the
/// source of a bind mount, plus the engine socket locations a malicious
/// config could use to hand a compromised container the host engine's own
/// control plane.
fn blocked_prefixes() -> Vec<PathBuf> {
    let mut prefixes: Vec<PathBuf> = vec![
        "/boot", "/dev", "/etc", "/proc", "/root", "/run", "/sys",
        "/private/boot", "/private/dev", "/private/etc", "/private/var",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect();

    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        prefixes.push(home.join(".docker"));
        prefixes.push(home.join(".colima"));
        prefixes.push(home.join(".rd"));
    }

    prefixes
}

fn is_blocked(path: &Path, prefixes: &[PathBuf]) -> bool {
    prefixes.iter().any(|p| path == p || path.starts_with(p))
}

/// Validate a single bind mount's source against the policy. Rejects:
/// non-absolute sources; sources under a blocklisted host path; sources
/// whose resolved real path (symlinks evaluated) falls under those same
/// prefixes; and sources that are themselves a UNIX-domain socket.
pub fn validate_bind(bind: &BindMount) -> Result<()> {
    let source = Path::new(&bind.source);

    if !source.is_absolute() {
        return Err(SandboxError::configuration_rejected(format!(
            "sandbox security: bind mount source must be absolute: {}",
            bind.source
        )));
    }

    let prefixes = blocked_prefixes();

    if is_blocked(source, &prefixes) {
        return Err(SandboxError::configuration_rejected(format!(
            "sandbox security: bind mount {:?} targets blocked path {:?}",
            bind.source, source
        )));
    }

    if let Ok(real) = std::fs::canonicalize(source) {
        if is_blocked(&real, &prefixes) {
            return Err(SandboxError::configuration_rejected(format!(
                "sandbox security: bind mount {:?} resolves to blocked path {:?}",
                bind.source, real
            )));
        }
    }

    if is_unix_socket(source) {
        return Err(SandboxError::configuration_rejected(format!(
            "sandbox security: bind mount source {:?} is a unix socket",
            bind.source
        )));
    }

    Ok(())
}

#[cfg(unix)]
fn is_unix_socket(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_unix_socket(_path: &Path) -> bool {
    false
}

/// Reject the case-insensitive value `host` for network mode.
pub fn validate_network_mode(mode: &str) -> Result<()> {
    if mode.eq_ignore_ascii_case("host") {
        return Err(SandboxError::configuration_rejected(
            "sandbox security: network mode \"host\" is not permitted",
        ));
    }
    Ok(())
}

/// Reject the case-insensitive value `unconfined` for a security profile.
pub fn validate_profile(kind: &str, profile: &Option<String>) -> Result<()> {
    if let Some(p) = profile {
        if p.eq_ignore_ascii_case("unconfined") {
            return Err(SandboxError::configuration_rejected(format!(
                "sandbox security: {} profile \"unconfined\" is not permitted",
                kind
            )));
        }
    }
    Ok(())
}

/// Secret-bearing env key patterns (case-insensitive), mirroring common
/// provider keys, chat/bot tokens, and a catch-all suffix pattern.
fn secret_patterns() -> &'static [&'static str] {
    &[
        r"(?i)^OPENAI_API_KEY$",
        r"(?i)^ANTHROPIC_API_KEY$",
        r"(?i)^GEMINI_API_KEY$",
        r"(?i)^GOOGLE_API_KEY$",
        r"(?i)^OPENROUTER_API_KEY$",
        r"(?i)^AWS_SECRET_ACCESS_KEY$",
        r"(?i)^AWS_SESSION_TOKEN$",
        r"(?i)^GITHUB_TOKEN$",
        r"(?i)^GH_TOKEN$",
        r"(?i)^AZURE_OPENAI_API_KEY$",
        r"(?i)^VERTEX_AI_API_KEY$",
        r"(?i)^TELEGRAM_BOT_TOKEN$",
        r"(?i)^DISCORD_BOT_TOKEN$",
        r"(?i)^SLACK_BOT_TOKEN$",
        r"(?i)^SLACK_APP_TOKEN$",
        r"(?i)^LINE_CHANNEL_TOKEN$",
        r"(?i)_?(API_KEY|TOKEN|PASSWORD|PRIVATE_KEY|SECRET)$",
    ]
}

/// Drop env keys matching a secret pattern and values containing a NUL
/// byte. An all-dropped map is returned empty (callers treat that as "no
/// env").
pub fn sanitize_env(env: &std::collections::BTreeMap<String, String>) -> std::collections::BTreeMap<String, String> {
    let patterns: Vec<Regex> = secret_patterns()
        .iter()
        .map(|p| Regex::new(p).expect("static pattern compiles"))
        .collect();

    env.iter()
        .filter(|(k, v)| {
            !patterns.iter().any(|re| re.is_match(k)) && !v.contains('\0')
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
