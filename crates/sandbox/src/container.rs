//! Container-backed `Sandbox`: creates, reuses, or rebuilds a long-lived
//! container per scope, keyed by a config hash recorded in the on-disk
//! registry.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{SandboxConfig, WorkspaceAccess};
use crate::contract::{DirEntry, ExecEvent, ExecEventSink, ExecRequest, ExecResult, Fs, Sandbox};
use crate::engine::{ContainerEngine, ContainerSpec, ExecChunk};
use crate::error::{ErrorKind, Result, SandboxError};
use crate::hash::config_hash;
use crate::registry::{now_ms, Registry, RegistryEntry};
use crate::security;
use multi_agent_core::events::{EventEnvelope, EventType};
use multi_agent_core::EventEmitter;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// A container last used within this window of now is "hot": a config-hash
/// mismatch against a hot, running container is treated as a benign in-flight
/// update rather than grounds for an immediate rebuild.
const HOT_CONTAINER_WINDOW_MS: i64 = 5 * 60 * 1000;

#[derive(Default)]
struct StartState {
    started: bool,
    sticky: Option<(ErrorKind, String)>,
}

/// Shared state behind a `ContainerSandbox` and the `ContainerFs` it hands
/// out, so filesystem calls can run the same create/reuse/rebuild check a
/// direct `exec` would.
struct Inner {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<Registry>,
    config: SandboxConfig,
    config_hash: String,
    container_name: String,
    state: AsyncMutex<StartState>,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl Inner {
    async fn emit(&self, event_type: EventType, payload: serde_json::Value) {
        if let Some(emitter) = &self.emitter {
            emitter
                .emit(EventEnvelope::new(event_type, payload).with_actor("container-sandbox"))
                .await;
        }
    }

    fn workspace_source_dir(&self) -> String {
        format!("{}/{}", self.config.workspace_root, self.container_name)
    }

    /// Resolve a container-side path (exec working dir, or an `Fs` call's
    /// path argument) against the configured workdir under the same
    /// no-escape rule the host backend applies to working directories
    /// and file I/O.
    fn resolve_path(&self, path: &str) -> Result<String> {
        crate::paths::resolve(&self.config.workdir, path, &self.config.workdir)
    }

    fn build_binds(&self) -> Result<Vec<String>> {
        let mut binds = Vec::new();

        match self.config.workspace.access {
            WorkspaceAccess::Isolated => {
                let source = self.workspace_source_dir();
                std::fs::create_dir_all(&source)?;
                binds.push(format!("{}:{}:rw,Z", source, self.config.workdir));
            }
            access => {
                let source = self.config.workspace.source.clone().ok_or_else(|| {
                    SandboxError::configuration_rejected(
                        "workspace access is read_only/read_write but no source path was configured",
                    )
                })?;
                let mode = if access == WorkspaceAccess::ReadOnly { "ro" } else { "rw" };
                binds.push(format!("{}:{}:{},Z", source, self.config.workdir, mode));
            }
        }

        for bind in &self.config.binds {
            security::validate_bind(bind)?;
            let mode = if bind.read_only { "ro" } else { "rw" };
            binds.push(format!("{}:{}:{},Z", bind.source, bind.target, mode));
        }

        Ok(binds)
    }

    fn build_security_opt(&self) -> Result<Vec<String>> {
        security::validate_profile("seccomp", &self.config.security.seccomp)?;
        security::validate_profile("apparmor", &self.config.security.apparmor)?;

        let mut opts = vec!["no-new-privileges".to_string()];
        if let Some(p) = &self.config.security.seccomp {
            opts.push(format!("seccomp={}", p));
        }
        if let Some(p) = &self.config.security.apparmor {
            opts.push(format!("apparmor={}", p));
        }
        Ok(opts)
    }

    fn build_spec(&self) -> Result<ContainerSpec> {
        security::validate_network_mode(&self.config.network_mode)?;

        let env: Vec<String> = security::sanitize_env(&self.config.env)
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let nano_cpus = self.config.limits.cpus.map(|cpus| (cpus * 1_000_000_000.0) as i64);

        Ok(ContainerSpec {
            name: self.container_name.clone(),
            image: self.config.image.clone(),
            workdir: self.config.workdir.clone(),
            user: self.config.user.as_docker_user(),
            cmd: vec!["sleep".to_string(), "infinity".to_string()],
            env,
            binds: self.build_binds()?,
            tmpfs: self
                .config
                .tmpfs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
            network_mode: self.config.network_mode.clone(),
            cap_drop: self.config.cap_drop.clone(),
            dns: self.config.dns.clone(),
            extra_hosts: self.config.extra_hosts.clone(),
            security_opt: self.build_security_opt()?,
            pids_limit: self.config.limits.pids_limit,
            memory_bytes: self.config.limits.memory_bytes,
            memory_swap_bytes: self.config.limits.memory_swap_bytes,
            nano_cpus,
            ulimits: self.config.limits.ulimits.clone(),
        })
    }

    async fn create_and_start(&self) -> Result<()> {
        if !self.engine.image_exists(&self.config.image).await? {
            self.engine.pull_image(&self.config.image).await?;
        }

        let spec = self.build_spec()?;
        self.engine.create_container(&spec).await?;
        self.engine.start_container(&self.container_name).await?;

        let now = now_ms();
        self.registry
            .upsert(RegistryEntry {
                container_name: self.container_name.clone(),
                image: self.config.image.clone(),
                config_hash: self.config_hash.clone(),
                created_at_ms: now,
                last_used_at_ms: now,
            })
            .await?;

        if let Some(setup) = &self.config.setup_command {
            let result = self.run_argv(vec!["/bin/sh".into(), "-c".into(), setup.clone()], None, DEFAULT_TIMEOUT_MS).await;
            match result {
                Ok(r) if r.success() => {}
                Ok(r) => {
                    let _ = self.engine.remove_container(&self.container_name, true).await;
                    let _ = self.registry.remove(&self.container_name).await;
                    return Err(SandboxError::setup_failed(format!(
                        "setup command exited with status {}",
                        r.exit_code
                    ))
                    .with_partial(r));
                }
                Err(e) => {
                    let _ = self.engine.remove_container(&self.container_name, true).await;
                    let _ = self.registry.remove(&self.container_name).await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn rebuild(&self) -> Result<()> {
        let _ = self.engine.stop_container(&self.container_name).await;
        self.engine.remove_container(&self.container_name, true).await?;
        self.create_and_start().await
    }

    async fn do_start(&self) -> Result<()> {
        self.engine.ping().await?;

        match self.registry.get(&self.container_name).await? {
            None => self.create_and_start().await,
            Some(entry) => {
                let running = self.engine.container_running(&self.container_name).await.unwrap_or(false);

                if entry.config_hash == self.config_hash {
                    if !running {
                        self.engine.start_container(&self.container_name).await?;
                    }
                    self.registry.touch_last_used(&self.container_name, now_ms()).await?;
                    return Ok(());
                }

                // Hash mismatch: a hot container (running, used within the last
                // 5 minutes) is left alone rather than disrupted mid-use; a cold
                // one is rebuilt from scratch against the current config.
                let hot = running && now_ms() - entry.last_used_at_ms < HOT_CONTAINER_WINDOW_MS;
                if hot {
                    tracing::warn!(
                        container = %self.container_name,
                        "configuration changed for a hot container; continuing to serve the running instance instead of rebuilding"
                    );
                    self.emit(
                        EventType::SandboxDrift,
                        serde_json::json!({
                            "container_name": self.container_name,
                            "expected_hash": self.config_hash,
                            "actual_hash": entry.config_hash,
                        }),
                    )
                    .await;
                    self.registry.touch_last_used(&self.container_name, now_ms()).await?;
                    Ok(())
                } else {
                    self.rebuild().await
                }
            }
        }
    }

    /// Re-run the create/reuse/rebuild decision, updating the sticky-start
    /// bookkeeping the public `Sandbox::start` contract exposes. Called at
    /// the entry of every `exec`/`exec_stream`/`Fs` call so a container
    /// stopped or drifted out from under a cached handle is brought back in
    /// line before the operation runs, not just once at the first `start()`.
    ///
    /// A latched sticky error is never retried here — it's returned as-is,
    /// fail-fast, until something clears it (`prune`). Engine errors aren't
    /// retried automatically; the caller retries the whole operation (after
    /// pruning) if it wants to.
    async fn ensure_container(&self) -> Result<()> {
        {
            let state = self.state.lock().await;
            if let Some((kind, message)) = &state.sticky {
                return Err(SandboxError::new(*kind, message.clone()));
            }
        }

        match self.do_start().await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.started = true;
                state.sticky = None;
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                state.sticky = Some((e.kind, e.message.clone()));
                Err(e)
            }
        }
    }

    /// `Sandbox::start`'s contract: a no-op once started, a fast repeat of
    /// the same error once stuck. Delegates to `ensure_container`, which
    /// already implements both halves of that contract; the extra
    /// `started`-gate here just skips the registry/engine round-trip when
    /// we already know we're in a good state.
    async fn checked_start(&self) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.started {
                return Ok(());
            }
        }
        self.ensure_container().await
    }

    async fn prune(&self) -> Result<()> {
        let _ = self.engine.stop_container(&self.container_name).await;
        self.engine.remove_container(&self.container_name, true).await?;
        self.registry.remove(&self.container_name).await?;

        let mut state = self.state.lock().await;
        state.started = false;
        state.sticky = None;
        Ok(())
    }

    async fn run_argv(&self, argv: Vec<String>, working_dir: Option<String>, timeout_ms: u64) -> Result<ExecResult> {
        self.run_argv_with_sink(argv, working_dir, timeout_ms, None).await
    }

    async fn run_argv_with_sink(
        &self,
        argv: Vec<String>,
        working_dir: Option<String>,
        timeout_ms: u64,
        on_event: Option<ExecEventSink>,
    ) -> Result<ExecResult> {
        let stdout = Arc::new(std::sync::Mutex::new(Vec::new()));
        let stderr = Arc::new(std::sync::Mutex::new(Vec::new()));

        let stdout_w = stdout.clone();
        let stderr_w = stderr.clone();
        let sink = on_event.clone();
        let on_chunk: Box<dyn FnMut(ExecChunk) + Send> = Box::new(move |chunk| match chunk {
            ExecChunk::Stdout(bytes) => {
                stdout_w.lock().unwrap().extend_from_slice(&bytes);
                if let Some(s) = &sink {
                    s(ExecEvent::Stdout(bytes));
                }
            }
            ExecChunk::Stderr(bytes) => {
                stderr_w.lock().unwrap().extend_from_slice(&bytes);
                if let Some(s) = &sink {
                    s(ExecEvent::Stderr(bytes));
                }
            }
        });

        let user = self.config.user.as_docker_user();
        let attach = self.engine.exec_start(
            &self.container_name,
            argv,
            working_dir,
            Some(user),
            None,
            on_chunk,
        );

        let exec_id = match tokio::time::timeout(Duration::from_millis(timeout_ms), attach).await {
            Ok(result) => result?,
            Err(_) => {
                let partial = ExecResult {
                    stdout: stdout.lock().unwrap().clone(),
                    stderr: stderr.lock().unwrap().clone(),
                    exit_code: -1,
                };
                return Err(SandboxError::timeout("exec deadline exceeded").with_partial(partial));
            }
        };

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let exit_code = loop {
            let status = self.engine.exec_status(&exec_id).await?;
            if !status.running {
                break status.exit_code.unwrap_or(-1);
            }
            if tokio::time::Instant::now() >= deadline {
                let partial = ExecResult {
                    stdout: stdout.lock().unwrap().clone(),
                    stderr: stderr.lock().unwrap().clone(),
                    exit_code: -1,
                };
                return Err(SandboxError::timeout("exec deadline exceeded waiting for exit").with_partial(partial));
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        };

        let result = ExecResult {
            stdout: stdout.lock().unwrap().clone(),
            stderr: stderr.lock().unwrap().clone(),
            exit_code,
        };

        if let Some(s) = &on_event {
            s(ExecEvent::Exit(exit_code));
        }

        Ok(result)
    }

    /// Run a shell script inside the container as the configured user and
    /// wait for its exit code, discarding stdout/stderr. `stdin`, if given,
    /// is written to the exec's attached input and then half-closed so the
    /// script sees EOF (used by `write_file`'s `cat > "$path"` pipeline).
    async fn run_as_user(&self, script: &str, stdin: Option<Vec<u8>>) -> Result<i64> {
        let on_chunk: Box<dyn FnMut(ExecChunk) + Send> = Box::new(|_| {});
        let exec_id = self
            .engine
            .exec_start(
                &self.container_name,
                vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
                None,
                Some(self.config.user.as_docker_user()),
                stdin,
                on_chunk,
            )
            .await?;

        loop {
            let status = self.engine.exec_status(&exec_id).await?;
            if !status.running {
                return Ok(status.exit_code.unwrap_or(-1));
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        }
    }
}

/// A single long-lived container serving one scope.
pub struct ContainerSandbox {
    inner: Arc<Inner>,
}

impl ContainerSandbox {
    pub fn new(
        container_name: String,
        config: SandboxConfig,
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<Registry>,
    ) -> Self {
        let config_hash = config_hash(&config);
        Self {
            inner: Arc::new(Inner {
                engine,
                registry,
                config,
                config_hash,
                container_name,
                state: AsyncMutex::new(StartState::default()),
                emitter: None,
            }),
        }
    }

    /// Tee lifecycle events (currently: drift warnings) to an external sink
    /// without this crate depending on any concrete observability backend.
    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_emitter called before any clone of the sandbox is shared")
            .emitter = Some(emitter);
        self
    }

    pub fn container_name(&self) -> &str {
        &self.inner.container_name
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    async fn start(&self) -> Result<()> {
        self.inner.checked_start().await
    }

    async fn prune(&self) -> Result<()> {
        self.inner.prune().await
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecResult> {
        self.inner.ensure_container().await?;
        let working_dir = req.working_dir.as_deref().map(|d| self.inner.resolve_path(d)).transpose()?;
        let argv = req.argv_or_shell(&["/bin/sh", "-c"]);
        let timeout_ms = req.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        self.inner.run_argv(argv, working_dir, timeout_ms).await
    }

    async fn exec_stream(&self, req: ExecRequest, on_event: ExecEventSink) -> Result<ExecResult> {
        self.inner.ensure_container().await?;
        let working_dir = req.working_dir.as_deref().map(|d| self.inner.resolve_path(d)).transpose()?;
        let argv = req.argv_or_shell(&["/bin/sh", "-c"]);
        let timeout_ms = req.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        self.inner.run_argv_with_sink(argv, working_dir, timeout_ms, Some(on_event)).await
    }

    fn fs(&self) -> Arc<dyn Fs> {
        Arc::new(ContainerFs {
            inner: self.inner.clone(),
        })
    }
}

/// Filesystem bridge into a running container. Shares `Inner` with the
/// `ContainerSandbox` it came from so every call re-runs the same
/// create/reuse/rebuild check an `exec` would, rather than assuming the
/// container a prior `start()` saw is still there.
struct ContainerFs {
    inner: Arc<Inner>,
}

/// Escape `s` for embedding inside single quotes in a POSIX shell script.
fn shell_single_quote(s: &str) -> String {
    s.replace('\'', "'\\''")
}

#[async_trait]
impl Fs for ContainerFs {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.ensure_container().await?;
        let path = &self.inner.resolve_path(path)?;

        let bytes = self.inner.engine.copy_from_container(&self.inner.container_name, path).await?;
        let basename = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();

        let mut archive = tar::Archive::new(std::io::Cursor::new(bytes));
        for entry in archive.entries().map_err(|e| SandboxError::io(e.to_string()))? {
            let mut entry = entry.map_err(|e| SandboxError::io(e.to_string()))?;
            let entry_path = entry.path().map_err(|e| SandboxError::io(e.to_string()))?;
            if entry_path.file_name().and_then(|n| n.to_str()) == Some(basename.as_str()) {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf).map_err(|e| SandboxError::io(e.to_string()))?;
                return Ok(buf);
            }
        }

        Err(SandboxError::not_found(format!("file not found in sandbox: {}", path)))
    }

    /// Writes as the configured container user via a small shell pipeline
    /// rather than a tar upload: `cat > "$path"` run under the configured
    /// user, fed the bytes over the exec's stdin, guarantees the file lands
    /// with that uid:gid and a current mtime, which `CopyToContainer` cannot
    /// promise on every engine.
    async fn write_file(&self, path: &str, data: &[u8], mkdir: bool) -> Result<()> {
        self.inner.ensure_container().await?;
        let path = &self.inner.resolve_path(path)?;

        let dir = Path::new(path)
            .parent()
            .and_then(|p| p.to_str())
            .unwrap_or("/")
            .to_string();

        let mut script = String::new();
        if mkdir && !dir.is_empty() && dir != "/" {
            script.push_str(&format!("mkdir -p '{}' && ", shell_single_quote(&dir)));
        }
        script.push_str(&format!("cat > '{}'", shell_single_quote(path)));

        let exit_code = self.inner.run_as_user(&script, Some(data.to_vec())).await?;
        if exit_code != 0 {
            return Err(SandboxError::io(format!(
                "write to {} inside container failed with exit code {}",
                path, exit_code
            )));
        }
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.inner.ensure_container().await?;
        let path = &self.inner.resolve_path(path)?;

        let bytes = self.inner.engine.copy_from_container(&self.inner.container_name, path).await?;
        let mut archive = tar::Archive::new(std::io::Cursor::new(bytes));

        // The engine's tar stream roots every entry at the requested
        // directory's own name (e.g. `dir/`, `dir/a.txt`, `dir/sub/b.txt`).
        // Strip that root segment first, then keep only entries with
        // exactly one segment left — the root entry itself (zero segments
        // left) and grandchildren (two or more) are both skipped.
        let mut entries = Vec::new();
        for entry in archive.entries().map_err(|e| SandboxError::io(e.to_string()))? {
            let entry = entry.map_err(|e| SandboxError::io(e.to_string()))?;
            let is_dir = entry.header().entry_type().is_dir();
            let entry_path = entry.path().map_err(|e| SandboxError::io(e.to_string()))?;
            let mut components = entry_path.components();

            // Skip the tar's root directory component.
            if components.next().is_none() {
                continue;
            }

            let name = match components.next() {
                Some(std::path::Component::Normal(n)) => n.to_string_lossy().into_owned(),
                _ => continue,
            };
            if components.next().is_some() {
                continue;
            }
            if name.is_empty() {
                continue;
            }
            entries.push(DirEntry { name, is_dir });
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::engine::mock::MockEngine;
    use crate::registry::RegistryEntry;

    fn test_sandbox(config: SandboxConfig, engine: Arc<MockEngine>, registry: Arc<Registry>) -> ContainerSandbox {
        ContainerSandbox::new("test-container".to_string(), config, engine, registry)
    }

    fn reg(dir: &std::path::Path) -> Arc<Registry> {
        Arc::new(Registry::at(dir.to_path_buf()))
    }

    /// Stopping a container whose registry hash still matches the current
    /// config must restart it in place, never remove/recreate it.
    #[tokio::test]
    async fn stopped_container_with_matching_hash_is_restarted_not_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.image = "img:latest".to_string();
        let engine = Arc::new(MockEngine::with_image(&config.image));
        let registry = reg(dir.path());

        let sandbox = test_sandbox(config.clone(), engine.clone(), registry.clone());
        sandbox.start().await.unwrap();
        assert!(engine.calls.lock().unwrap().iter().any(|c| c == "create:test-container"));

        // Simulate the container having stopped between calls.
        engine.running.lock().unwrap().clear();
        engine.calls.lock().unwrap().clear();

        // Force a fresh sandbox instance so `start()` re-evaluates rather
        // than short-circuiting on its own sticky `started` flag.
        let sandbox2 = test_sandbox(config, engine.clone(), registry);
        sandbox2.start().await.unwrap();

        let calls = engine.calls.lock().unwrap().clone();
        assert!(calls.contains(&"start:test-container".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("remove:")));
        assert!(!calls.iter().any(|c| c.starts_with("create:")));
    }

    /// A cold (stopped) container whose config hash has drifted is rebuilt.
    #[tokio::test]
    async fn stopped_container_with_drifted_hash_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let registry = reg(dir.path());
        let engine = Arc::new(MockEngine::with_image("img:latest"));

        registry
            .upsert(RegistryEntry {
                container_name: "test-container".to_string(),
                image: "img:latest".to_string(),
                config_hash: "stale-hash".to_string(),
                created_at_ms: now_ms() - 10_000,
                last_used_at_ms: now_ms() - 10_000,
            })
            .await
            .unwrap();
        // Not running: container_running() returns false by default.

        let mut config = SandboxConfig::default();
        config.image = "img:latest".to_string();
        let sandbox = test_sandbox(config, engine.clone(), registry);
        sandbox.start().await.unwrap();

        let calls = engine.calls.lock().unwrap().clone();
        assert!(calls.iter().any(|c| c.starts_with("create:")), "cold drifted container must be rebuilt");
    }

    /// A running, recently-used ("hot") container whose config hash has
    /// drifted is served as-is with a warning, not disrupted mid-use.
    #[tokio::test]
    async fn hot_container_with_drifted_hash_is_not_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let registry = reg(dir.path());
        let engine = Arc::new(MockEngine::with_image("img:latest"));
        engine.running.lock().unwrap().push("test-container".to_string());

        registry
            .upsert(RegistryEntry {
                container_name: "test-container".to_string(),
                image: "img:latest".to_string(),
                config_hash: "stale-hash".to_string(),
                created_at_ms: now_ms() - 10_000,
                last_used_at_ms: now_ms(),
            })
            .await
            .unwrap();

        let mut config = SandboxConfig::default();
        config.image = "img:latest".to_string();
        let sandbox = test_sandbox(config, engine.clone(), registry);
        sandbox.start().await.unwrap();

        let calls = engine.calls.lock().unwrap().clone();
        assert!(!calls.iter().any(|c| c.starts_with("remove:")), "a hot drifted container must not be rebuilt");
        assert!(!calls.iter().any(|c| c.starts_with("create:")));
    }

    /// A non-zero setup command removes the freshly created container and
    /// its registry entry.
    #[tokio::test]
    async fn setup_failure_removes_container_and_registry_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = reg(dir.path());
        let engine = Arc::new(MockEngine::with_image("img:latest"));
        *engine.scripted_exit_code.lock().unwrap() = 7;

        let mut config = SandboxConfig::default();
        config.image = "img:latest".to_string();
        config.setup_command = Some("exit 7".to_string());
        let sandbox = test_sandbox(config, engine.clone(), registry.clone());

        let err = sandbox.start().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SetupFailed);
        assert!(registry.get("test-container").await.unwrap().is_none());
        assert!(engine.calls.lock().unwrap().iter().any(|c| c.starts_with("remove:")));
    }

    /// A config-hash drift on a cold container is picked up by the very next
    /// `exec`, not just by an explicit `start()` — the create/reuse/rebuild
    /// check runs on every call, not only the first.
    #[tokio::test]
    async fn exec_after_external_stop_and_drift_rebuilds_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let registry = reg(dir.path());
        let engine = Arc::new(MockEngine::with_image("img:latest"));

        let mut config = SandboxConfig::default();
        config.image = "img:latest".to_string();
        let sandbox = test_sandbox(config.clone(), engine.clone(), registry.clone());
        sandbox.start().await.unwrap();
        engine.calls.lock().unwrap().clear();

        // Container stops and the scope's config changes out from under the
        // cached sandbox handle, without any new call to `start()`.
        engine.running.lock().unwrap().clear();
        config.env.insert("NEW_VAR".to_string(), "1".to_string());
        let sandbox = ContainerSandbox::new("test-container".to_string(), config, engine.clone(), registry);

        sandbox.exec(ExecRequest::shell("true")).await.unwrap();

        let calls = engine.calls.lock().unwrap().clone();
        assert!(calls.iter().any(|c| c.starts_with("create:")), "drifted cold container must be rebuilt before exec runs");
    }

    /// `Fs` operations run the same ensure-container check `exec` does: a
    /// stopped container is restarted before a read/write is attempted.
    #[tokio::test]
    async fn fs_write_restarts_a_stopped_container_first() {
        let dir = tempfile::tempdir().unwrap();
        let registry = reg(dir.path());
        let engine = Arc::new(MockEngine::with_image("img:latest"));

        let mut config = SandboxConfig::default();
        config.image = "img:latest".to_string();
        let sandbox = test_sandbox(config, engine.clone(), registry);
        sandbox.start().await.unwrap();
        engine.running.lock().unwrap().clear();
        engine.calls.lock().unwrap().clear();

        let fs = sandbox.fs();
        fs.write_file("/workspace/out.txt", b"hi", false).await.unwrap();

        let calls = engine.calls.lock().unwrap().clone();
        assert!(calls.contains(&"start:test-container".to_string()));
    }

    /// A write is executed under the configured container user, not the
    /// container's default user, so the written file inherits that uid:gid.
    #[tokio::test]
    async fn write_file_runs_as_configured_user() {
        let dir = tempfile::tempdir().unwrap();
        let registry = reg(dir.path());
        let engine = Arc::new(MockEngine::with_image("img:latest"));

        let mut config = SandboxConfig::default();
        config.image = "img:latest".to_string();
        config.user = crate::config::UserSpec { uid: 4242, gid: 4242 };
        let sandbox = test_sandbox(config, engine.clone(), registry);
        sandbox.start().await.unwrap();

        let fs = sandbox.fs();
        fs.write_file("/workspace/out.txt", b"hi", false).await.unwrap();

        assert_eq!(*engine.last_exec_user.lock().unwrap(), Some("4242:4242".to_string()));
    }

    /// A file path outside the configured workdir is rejected before any
    /// engine call is made, the same no-escape rule the host backend applies.
    #[tokio::test]
    async fn fs_write_rejects_path_outside_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let registry = reg(dir.path());
        let engine = Arc::new(MockEngine::with_image("img:latest"));

        let mut config = SandboxConfig::default();
        config.image = "img:latest".to_string();
        let sandbox = test_sandbox(config, engine.clone(), registry);
        sandbox.start().await.unwrap();

        let err = sandbox.fs().write_file("../etc/passwd", b"x", false).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AccessDenied);
        assert!(engine.last_exec_user.lock().unwrap().is_none(), "no exec should run once the path is rejected");
    }

    /// An exec working directory outside the configured workdir is rejected
    /// before the command is dispatched to the engine.
    #[tokio::test]
    async fn exec_rejects_working_dir_outside_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let registry = reg(dir.path());
        let engine = Arc::new(MockEngine::with_image("img:latest"));

        let mut config = SandboxConfig::default();
        config.image = "img:latest".to_string();
        let sandbox = test_sandbox(config, engine.clone(), registry);
        sandbox.start().await.unwrap();

        let err = sandbox
            .exec(ExecRequest::shell("true").with_working_dir("../../etc"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AccessDenied);
    }
}
