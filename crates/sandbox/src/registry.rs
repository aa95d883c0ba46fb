//! Disk-persisted registry of live containers: a flat JSON file with a
//! sidecar lock rather than an embedded database — the write rate is low
//! (seconds-scale) and cross-process safety is required because a CLI and a
//! daemon may both run against the same state directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use crate::error::{Result, SandboxError};

const LOCK_TIMEOUT: Duration = Duration::from_secs(3);
const LOCK_BACKOFF: Duration = Duration::from_millis(20);

/// One live container known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub container_name: String,
    pub image: String,
    pub config_hash: String,
    pub created_at_ms: i64,
    pub last_used_at_ms: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    entries: Vec<RegistryEntry>,
}

/// Current time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Resolve the state directory root: `PICOCLAW_HOME` override, falling back
/// to the user's home directory, then to a system temp directory.
pub fn state_dir() -> PathBuf {
    if let Ok(home) = std::env::var("PICOCLAW_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        if !profile.is_empty() {
            return PathBuf::from(profile);
        }
    }
    std::env::temp_dir()
}

fn registry_path(root: &Path) -> PathBuf {
    root.join("sandbox").join("containers.json")
}

fn lock_path(root: &Path) -> PathBuf {
    root.join("sandbox").join("registry.json.lock")
}

/// Cross-process marker-file lock: created with `O_EXCL` semantics via
/// `create_new`, released by removing the file on drop (scope exit).
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + LOCK_TIMEOUT;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(SandboxError::timeout(format!(
                            "timed out waiting for registry lock at {:?}",
                            path
                        )));
                    }
                    tokio::time::sleep(LOCK_BACKOFF).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// In-process handle to the disk registry. Guards reads/rewrites with a
/// process-local mutex in addition to the cross-process file lock, so two
/// callers in the same process serialize without contending on the file.
pub struct Registry {
    root: PathBuf,
    local: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::at(state_dir())
    }

    pub fn at(root: PathBuf) -> Self {
        Self {
            root,
            local: Mutex::new(()),
        }
    }

    fn read_unlocked(&self) -> Result<Vec<RegistryEntry>> {
        let path = registry_path(&self.root);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let file: RegistryFile = serde_json::from_slice(&bytes)
                    .map_err(|e| SandboxError::internal(format!("corrupt registry file: {}", e)))?;
                Ok(file.entries)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_unlocked(&self, entries: &[RegistryEntry]) -> Result<()> {
        let dir = self.root.join("sandbox");
        std::fs::create_dir_all(&dir)?;
        let path = registry_path(&self.root);
        let tmp = dir.join(format!("containers.json.{}.tmp", std::process::id()));

        let file = RegistryFile {
            entries: entries.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| SandboxError::internal(format!("failed to serialize registry: {}", e)))?;

        {
            use std::io::Write;
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        if let Ok(dir_handle) = std::fs::File::open(&dir) {
            let _ = dir_handle.sync_all();
        }
        Ok(())
    }

    async fn with_lock<T>(&self, f: impl FnOnce(&mut Vec<RegistryEntry>) -> Result<T>) -> Result<T> {
        let _local_guard = self.local.lock().await;
        std::fs::create_dir_all(self.root.join("sandbox"))?;
        let _file_lock = FileLock::acquire(lock_path(&self.root)).await?;

        let mut entries = self.read_unlocked()?;
        let result = f(&mut entries)?;
        self.write_unlocked(&entries)?;
        Ok(result)
    }

    /// Snapshot of all entries, taken under the same lock as mutations.
    pub async fn list(&self) -> Result<Vec<RegistryEntry>> {
        let _local_guard = self.local.lock().await;
        self.read_unlocked()
    }

    pub async fn get(&self, container_name: &str) -> Result<Option<RegistryEntry>> {
        let name = container_name.to_string();
        self.with_lock(move |entries| {
            Ok(entries.iter().find(|e| e.container_name == name).cloned())
        })
        .await
    }

    /// Insert or replace the entry for `container_name`. `created_at_ms` is
    /// preserved across upserts when a prior entry had one set; `last_used_at_ms`
    /// is always the value passed in, and callers are responsible for
    /// monotonicity.
    pub async fn upsert(&self, mut entry: RegistryEntry) -> Result<()> {
        self.with_lock(move |entries| {
            if let Some(existing) = entries.iter().find(|e| e.container_name == entry.container_name) {
                entry.created_at_ms = existing.created_at_ms;
            }
            entries.retain(|e| e.container_name != entry.container_name);
            entries.push(entry);
            Ok(())
        })
        .await
    }

    pub async fn touch_last_used(&self, container_name: &str, now_ms: i64) -> Result<()> {
        let name = container_name.to_string();
        self.with_lock(move |entries| {
            if let Some(e) = entries.iter_mut().find(|e| e.container_name == name) {
                e.last_used_at_ms = now_ms;
            }
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, container_name: &str) -> Result<()> {
        let name = container_name.to_string();
        self.with_lock(move |entries| {
            entries.retain(|e| e.container_name != name);
            Ok(())
        })
        .await
    }

    /// Entries evictable by the retention policy: idle beyond `idle_hours`
    /// or older than `max_age_days`.
    pub fn evictable(
        entries: &[RegistryEntry],
        now_ms: i64,
        idle_hours: i64,
        max_age_days: i64,
    ) -> Vec<RegistryEntry> {
        let idle_ms = idle_hours.saturating_mul(3_600_000);
        let age_ms = max_age_days.saturating_mul(86_400_000);
        entries
            .iter()
            .filter(|e| {
                let idle = idle_hours > 0 && now_ms - e.last_used_at_ms > idle_ms;
                let aged = max_age_days > 0 && now_ms - e.created_at_ms > age_ms;
                idle || aged
            })
            .cloned()
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Slug a scope key into a container-name-safe fragment: lowercase,
/// non-alphanumerics collapsed to `-`, trimmed, truncated to 32 chars, plus
/// a stable 4-byte hex suffix of `sha256(scope_key)` to guarantee
/// uniqueness after truncation.
pub fn slug_container_name(prefix: &str, scope_key: &str) -> String {
    use sha2::{Digest, Sha256};

    let mut slug = String::new();
    let mut last_was_dash = false;
    for ch in scope_key.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    let slug = slug.trim_matches('-');
    let truncated: String = slug.chars().take(32).collect();

    let digest = Sha256::digest(scope_key.as_bytes());
    let suffix: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();

    format!("{}{}-{}", prefix, truncated, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_registry() -> (Registry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Registry::at(dir.path().to_path_buf()), dir)
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let (reg, _dir) = temp_registry();
        assert!(reg.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_preserves_created_at_across_reuse() {
        let (reg, _dir) = temp_registry();
        reg.upsert(RegistryEntry {
            container_name: "c1".into(),
            image: "img".into(),
            config_hash: "h1".into(),
            created_at_ms: 1000,
            last_used_at_ms: 1000,
        })
        .await
        .unwrap();

        reg.upsert(RegistryEntry {
            container_name: "c1".into(),
            image: "img".into(),
            config_hash: "h1".into(),
            created_at_ms: 9999, // should be overridden by preserved value
            last_used_at_ms: 2000,
        })
        .await
        .unwrap();

        let entry = reg.get("c1").await.unwrap().unwrap();
        assert_eq!(entry.created_at_ms, 1000);
        assert_eq!(entry.last_used_at_ms, 2000);
    }

    #[tokio::test]
    async fn evictable_by_idle_and_age() {
        let now = now_ms();
        let entries = vec![
            RegistryEntry {
                container_name: "idle".into(),
                image: "img".into(),
                config_hash: "h".into(),
                created_at_ms: now,
                last_used_at_ms: now - 2 * 3_600_000,
            },
            RegistryEntry {
                container_name: "fresh".into(),
                image: "img".into(),
                config_hash: "h".into(),
                created_at_ms: now,
                last_used_at_ms: now,
            },
        ];
        let evictable = Registry::evictable(&entries, now, 1, 0);
        assert_eq!(evictable.len(), 1);
        assert_eq!(evictable[0].container_name, "idle");
    }

    #[test]
    fn slug_truncates_and_suffixes() {
        let name = slug_container_name("opencoordex-", "agent:some very long agent identifier!!");
        assert!(name.starts_with("opencoordex-"));
        assert!(name.len() <= "opencoordex-".len() + 32 + 1 + 8);
    }

    #[tokio::test]
    async fn concurrent_upserts_serialize_without_loss() {
        let dir = tempfile::tempdir().unwrap();
        let reg = std::sync::Arc::new(Registry::at(dir.path().to_path_buf()));

        let mut handles = Vec::new();
        for i in 0..10 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.upsert(RegistryEntry {
                    container_name: format!("c{}", i),
                    image: "img".into(),
                    config_hash: "h".into(),
                    created_at_ms: now_ms(),
                    last_used_at_ms: now_ms(),
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let entries = reg.list().await.unwrap();
        assert_eq!(entries.len(), 10);
    }
}
