//! Scope manager: routes a request to the host sandbox or to a per-scope
//! container, derives the scope key that decides container sharing, and
//! runs the idle/age pruning loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use multi_agent_core::events::{EventEnvelope, EventType};
use multi_agent_core::{EventEmitter, RequestContext};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{SandboxConfig, SandboxMode, SandboxScope, WorkspaceAccess};
use crate::container::ContainerSandbox;
use crate::contract::Sandbox;
use crate::engine::ContainerEngine;
use crate::error::Result;
use crate::host::HostSandbox;
use crate::registry::{now_ms, slug_container_name, Registry};

const PRUNE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Normalize a session identifier against its agent: empty, "main", and
/// "`<agent_id>`:main" (all case-insensitive) collapse to the agent's own
/// canonical main-session key, `<agent_id>:main` — so every spelling of the
/// main session for a given agent lands on the same key, while two agents'
/// main sessions still stay distinct.
fn normalize_session(session: &str, agent_id: &str) -> String {
    let trimmed = session.trim();
    let agent_main = format!("{}:main", agent_id);
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("main") || trimmed.eq_ignore_ascii_case(&agent_main) {
        agent_main
    } else {
        trimmed.to_string()
    }
}

/// Dispatches sandbox requests to the host or to a per-scope container,
/// caching container handles for reuse and seeding isolated workspaces.
pub struct ScopeManager {
    config: SandboxConfig,
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<Registry>,
    host: Arc<HostSandbox>,
    containers: AsyncMutex<HashMap<String, Arc<ContainerSandbox>>>,
    event_emitter: Option<Arc<dyn EventEmitter>>,
    prune_loop: AsyncMutex<Option<PruneLoopHandle>>,
}

/// The running pruning task plus the channel used to stop it deterministically.
struct PruneLoopHandle {
    shutdown: tokio::sync::oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ScopeManager {
    pub fn new(config: SandboxConfig, engine: Arc<dyn ContainerEngine>, registry: Arc<Registry>) -> Self {
        let host = Arc::new(HostSandbox::new(config.workdir.clone(), true));
        Self {
            config,
            engine,
            registry,
            host,
            containers: AsyncMutex::new(HashMap::new()),
            event_emitter: None,
            prune_loop: AsyncMutex::new(None),
        }
    }

    /// Tee sandbox lifecycle events (create/prune/drift) to an external sink
    /// without this crate depending on any concrete observability backend.
    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.event_emitter = Some(emitter);
        self
    }

    async fn emit(&self, event_type: EventType, payload: serde_json::Value) {
        if let Some(emitter) = &self.event_emitter {
            emitter
                .emit(EventEnvelope::new(event_type, payload).with_actor("scope-manager"))
                .await;
        }
    }

    /// Whether `tool_name` is permitted to run inside the sandbox. An empty
    /// allow-list denies every tool.
    pub fn is_tool_sandboxed(&self, tool_name: &str) -> bool {
        self.config.sandboxed_tools.iter().any(|t| t == tool_name)
    }

    fn scope_key(&self, ctx: &RequestContext) -> String {
        match self.config.scope {
            SandboxScope::Shared => "shared".to_string(),
            SandboxScope::Agent => {
                let agent = ctx.agent_id.clone().unwrap_or_else(|| "default".to_string());
                format!("agent:{}", agent)
            }
            SandboxScope::Session => {
                let agent = ctx.agent_id.clone().unwrap_or_else(|| "default".to_string());
                let session = ctx.session_key.clone().unwrap_or_default();
                normalize_session(&session, &agent)
            }
        }
    }

    /// Resolve which sandbox backend should serve `ctx`, creating and
    /// starting a container on first use for container-routed modes.
    pub async fn get_or_create(&self, ctx: &RequestContext) -> Result<Arc<dyn Sandbox>> {
        match self.config.mode {
            // `non_main` is implemented as an alias of `off` until session-key
            // propagation is guaranteed everywhere a caller might invoke the
            // sandbox from.
            SandboxMode::Off | SandboxMode::NonMain => {
                self.host.start().await?;
                Ok(self.host.clone() as Arc<dyn Sandbox>)
            }
            SandboxMode::All => {
                let scope_key = self.scope_key(ctx);
                let container_name = slug_container_name(&self.config.container_prefix, &scope_key);

                let mut containers = self.containers.lock().await;
                if let Some(existing) = containers.get(&container_name) {
                    return Ok(existing.clone() as Arc<dyn Sandbox>);
                }

                let mut sandbox = ContainerSandbox::new(
                    container_name.clone(),
                    self.config.clone(),
                    self.engine.clone(),
                    self.registry.clone(),
                );
                if let Some(emitter) = &self.event_emitter {
                    sandbox = sandbox.with_emitter(emitter.clone());
                }
                let sandbox = Arc::new(sandbox);

                if self.config.workspace.access == WorkspaceAccess::Isolated {
                    self.seed_workspace(&container_name)?;
                }

                sandbox.start().await?;
                containers.insert(container_name.clone(), sandbox.clone());
                self.emit(
                    EventType::SandboxCreated,
                    serde_json::json!({ "container_name": container_name, "scope_key": scope_key }),
                )
                .await;
                Ok(sandbox as Arc<dyn Sandbox>)
            }
        }
    }

    fn seed_template_dir(&self) -> PathBuf {
        Path::new(&self.config.workspace_root).join("_seed")
    }

    /// Populate a fresh isolated workspace from a shared seed template:
    /// ordinary files are copied only if the destination doesn't already
    /// have them (a prior run's edits are preserved), while `skills/` is
    /// removed and recopied wholesale on every call so it always reflects
    /// the latest bundled skills.
    fn seed_workspace(&self, container_name: &str) -> Result<()> {
        let target = Path::new(&self.config.workspace_root).join(container_name);
        std::fs::create_dir_all(&target)?;

        let seed = self.seed_template_dir();
        if !seed.exists() {
            return Ok(());
        }

        for entry in std::fs::read_dir(&seed)? {
            let entry = entry?;
            if entry.file_name() == "skills" {
                continue;
            }
            let dest = target.join(entry.file_name());
            if dest.exists() {
                continue;
            }
            copy_recursive(&entry.path(), &dest)?;
        }

        let seed_skills = seed.join("skills");
        if seed_skills.exists() {
            let dest_skills = target.join("skills");
            let _ = std::fs::remove_dir_all(&dest_skills);
            copy_recursive(&seed_skills, &dest_skills)?;
        }

        Ok(())
    }

    /// Evict containers idle or aged past the configured retention policy.
    /// Intended to be polled on `PRUNE_PERIOD` by the loop spawned from `start`.
    pub async fn prune_once(&self) -> Result<usize> {
        if !self.config.retention.enabled() {
            return Ok(0);
        }

        let entries = self.registry.list().await?;
        let evictable = Registry::evictable(
            &entries,
            now_ms(),
            self.config.retention.idle_hours,
            self.config.retention.max_age_days,
        );

        for entry in &evictable {
            let _ = self.engine.stop_container(&entry.container_name).await;
            let _ = self.engine.remove_container(&entry.container_name, true).await;
            let _ = self.registry.remove(&entry.container_name).await;
            self.containers.lock().await.remove(&entry.container_name);
            self.emit(
                EventType::SandboxPruned,
                serde_json::json!({ "container_name": entry.container_name }),
            )
            .await;
        }

        Ok(evictable.len())
    }

    /// Start the background pruning loop if either retention knob is
    /// positive. Idempotent: a second call while one is already running is
    /// a no-op.
    pub async fn start(self: &Arc<Self>) {
        if !self.config.retention.enabled() {
            return;
        }
        let mut slot = self.prune_loop.lock().await;
        if slot.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        let this = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(PRUNE_PERIOD) => {
                        if let Err(e) = this.prune_once().await {
                            tracing::warn!(error = %e, "sandbox pruning pass failed");
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });
        *slot = Some(PruneLoopHandle { shutdown: shutdown_tx, task });
    }

    /// Stop the pruning loop deterministically (cancel + wait on its done
    /// channel), then prune every cached container sandbox and the host
    /// sandbox's own root descriptor.
    pub async fn prune(&self) -> Result<()> {
        if let Some(handle) = self.prune_loop.lock().await.take() {
            let _ = handle.shutdown.send(());
            let _ = handle.task.await;
        }

        let mut containers = self.containers.lock().await;
        for (_, sandbox) in containers.drain() {
            sandbox.prune().await?;
        }
        drop(containers);

        self.host.prune().await?;
        Ok(())
    }
}

fn copy_recursive(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(src, dest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_session_normalizes_case_insensitively_per_agent() {
        assert_eq!(normalize_session("main", "agent-a"), "agent-a:main");
        assert_eq!(normalize_session("MAIN", "agent-a"), "agent-a:main");
        assert_eq!(normalize_session("", "agent-a"), "agent-a:main");
        assert_eq!(normalize_session("  ", "agent-a"), "agent-a:main");
        assert_eq!(normalize_session("agent-a:MAIN", "agent-a"), "agent-a:main");
        assert_eq!(normalize_session("worker-7", "agent-a"), "worker-7");
    }

    #[test]
    fn two_agents_main_sessions_stay_distinct() {
        assert_ne!(normalize_session("main", "agent-a"), normalize_session("main", "agent-b"));
    }

    #[test]
    fn empty_allow_list_denies_every_tool() {
        let config = SandboxConfig::default();
        let manager = ScopeManager::new(
            config,
            Arc::new(crate::engine::mock::MockEngine::default()),
            Arc::new(Registry::at(std::env::temp_dir())),
        );
        assert!(!manager.is_tool_sandboxed("exec"));
        assert!(!manager.is_tool_sandboxed("write_file"));
    }

    #[test]
    fn allow_listed_tool_is_sandboxed() {
        let mut config = SandboxConfig::default();
        config.sandboxed_tools = vec!["exec".to_string()];
        let manager = ScopeManager::new(
            config,
            Arc::new(crate::engine::mock::MockEngine::default()),
            Arc::new(Registry::at(std::env::temp_dir())),
        );
        assert!(manager.is_tool_sandboxed("exec"));
        assert!(!manager.is_tool_sandboxed("read_file"));
    }

    /// A registry entry idle longer than `idle_hours` is evicted on the next
    /// pruning pass: its container is stopped/removed and its registry entry
    /// dropped.
    #[tokio::test]
    async fn prune_once_evicts_idle_entry() {
        use crate::registry::RegistryEntry;

        let dir = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.mode = SandboxMode::All;
        config.retention = crate::config::RetentionPolicy { idle_hours: 1, max_age_days: 0 };

        let engine = Arc::new(crate::engine::mock::MockEngine::with_image(&config.image));
        let registry = Arc::new(Registry::at(dir.path().to_path_buf()));
        registry
            .upsert(RegistryEntry {
                container_name: "idle-container".to_string(),
                image: config.image.clone(),
                config_hash: "h".to_string(),
                created_at_ms: now_ms() - 3 * 3_600_000,
                last_used_at_ms: now_ms() - 2 * 3_600_000,
            })
            .await
            .unwrap();
        engine.containers.lock().unwrap().push("idle-container".to_string());

        let manager = ScopeManager::new(config, engine.clone(), registry.clone());
        let evicted = manager.prune_once().await.unwrap();

        assert_eq!(evicted, 1);
        assert!(registry.get("idle-container").await.unwrap().is_none());
        assert!(!engine.containers.lock().unwrap().contains(&"idle-container".to_string()));
    }
}
