//! Stable config hash: a hex digest over a canonicalized JSON projection of
//! `SandboxConfig`. Two configs that are behaviorally equivalent must hash
//! equal; any material change must change the hash.

use sha2::{Digest, Sha256};

use crate::config::SandboxConfig;

/// Hex-encoded SHA-256 digest of the canonical JSON projection of `config`.
///
/// `serde_json::Map` in this workspace is backed by a `BTreeMap` (the
/// `preserve_order` feature is never enabled), so object keys already
/// serialize in sorted order at every nesting level — this is what makes two
/// configs differing only in `env` key-insertion order hash identically.
/// Arrays (binds, dns, tmpfs, cap_drop — all `Vec`s) are left in the order
/// `SandboxConfig` gives them, since ordering is semantically meaningful
/// there.
pub fn config_hash(config: &SandboxConfig) -> String {
    let value = serde_json::to_value(config).expect("SandboxConfig is always serializable");
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).expect("canonicalized value is serializable");
    let digest = Sha256::digest(&bytes);
    to_hex(&digest)
}

/// Recursively trims whitespace on every string leaf.
fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k, canonicalize(v));
            }
            Value::Object(out)
        }
        other => other,
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn base() -> SandboxConfig {
        SandboxConfig::default()
    }

    #[test]
    fn env_key_order_does_not_affect_hash() {
        let mut a = base();
        let mut env_a = BTreeMap::new();
        env_a.insert("B".to_string(), "2".to_string());
        env_a.insert("A".to_string(), "1".to_string());
        a.env = env_a;

        let mut b = base();
        let mut env_b = BTreeMap::new();
        env_b.insert("A".to_string(), "1".to_string());
        env_b.insert("B".to_string(), "2".to_string());
        b.env = env_b;

        assert_eq!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn bind_order_changes_hash() {
        let mut a = base();
        a.dns = vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()];

        let mut b = base();
        b.dns = vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()];

        assert_ne!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn tmpfs_order_changes_hash() {
        let mut a = base();
        a.tmpfs = vec![
            ("/tmp".to_string(), "size=64m".to_string()),
            ("/run".to_string(), "".to_string()),
        ];

        let mut b = base();
        b.tmpfs = vec![
            ("/run".to_string(), "".to_string()),
            ("/tmp".to_string(), "size=64m".to_string()),
        ];

        assert_ne!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn whitespace_is_trimmed() {
        let mut a = base();
        a.image = "my-image:latest".to_string();
        let mut b = base();
        b.image = "  my-image:latest  ".to_string();
        assert_eq!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn material_change_changes_hash() {
        let a = base();
        let mut b = base();
        b.image = "other-image:latest".to_string();
        assert_ne!(config_hash(&a), config_hash(&b));
    }
}
