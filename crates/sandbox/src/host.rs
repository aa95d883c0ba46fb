//! Host-process `Sandbox`: runs commands directly on the host under a plain
//! `tokio::process::Command`, confined to a workspace directory by an
//! OS-anchored directory descriptor where available.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::contract::{DirEntry, ExecEvent, ExecEventSink, ExecRequest, ExecResult, Fs, Sandbox};
use crate::error::{Result, SandboxError};
use crate::paths;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Confines filesystem access to `workdir`. When `restrict` is set, `Start`
/// opens a `cap_std::fs::Dir` rooted at the workspace and holds it for the
/// sandbox's lifetime: every path is looked up relative to that open
/// directory descriptor (`openat` underneath), so a symlink swapped in after
/// the textual check still can't walk the access outside the workspace.
/// `Prune` drops the descriptor.
pub struct HostSandbox {
    workdir: String,
    restrict: bool,
    root: std::sync::Mutex<Option<Arc<cap_std::fs::Dir>>>,
}

impl HostSandbox {
    pub fn new(workdir: impl Into<String>, restrict: bool) -> Self {
        Self {
            workdir: workdir.into(),
            restrict,
            root: std::sync::Mutex::new(None),
        }
    }

}

/// Re-resolve every ancestor of `absolute` (relative to `workdir`) through
/// `canonicalize` so a symlink planted between the lexical check and the
/// actual filesystem access can't redirect access outside the workspace.
/// Used both by the restricted backend when no root descriptor is open yet,
/// and as the textual-resolution validator for unrestricted/empty-workspace
/// mode (spec §4.5) — the same symlink defense applies in both cases, only
/// the OS-anchored root descriptor is unavailable.
fn revalidate_against_symlinks(workdir: &str, absolute: &str) -> Result<PathBuf> {
    let root_real = std::fs::canonicalize(workdir).unwrap_or_else(|_| PathBuf::from(workdir));
    let mut current = root_real.clone();
    let rel = absolute
        .strip_prefix(workdir)
        .unwrap_or(absolute)
        .trim_start_matches('/')
        .to_string();

    for component in rel.split('/').filter(|c| !c.is_empty()) {
        current.push(component);
        if let Ok(real) = std::fs::canonicalize(&current) {
            if real != current && !real.starts_with(&root_real) {
                return Err(SandboxError::access_denied(format!(
                    "access denied: path escapes workspace via symlink: {}",
                    absolute
                )));
            }
        }
    }

    Ok(PathBuf::from(absolute))
}

#[async_trait]
impl Sandbox for HostSandbox {
    async fn start(&self) -> Result<()> {
        if self.root.lock().unwrap().is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.workdir)?;

        if self.restrict {
            if let Ok(dir) = cap_std::fs::Dir::open_ambient_dir(&self.workdir, cap_std::ambient_authority()) {
                *self.root.lock().unwrap() = Some(Arc::new(dir));
            }
        }
        Ok(())
    }

    /// Drops the open root descriptor, if any. Safe to call repeatedly or
    /// without a prior `Start`.
    async fn prune(&self) -> Result<()> {
        self.root.lock().unwrap().take();
        Ok(())
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecResult> {
        run_host_exec(&self.workdir, req, None).await
    }

    async fn exec_stream(&self, req: ExecRequest, on_event: ExecEventSink) -> Result<ExecResult> {
        run_host_exec(&self.workdir, req, Some(on_event)).await
    }

    fn fs(&self) -> Arc<dyn Fs> {
        Arc::new(HostFs {
            workdir: self.workdir.clone(),
            restrict: self.restrict,
            root: self.root.lock().unwrap().clone(),
        })
    }
}

async fn run_host_exec(workdir: &str, req: ExecRequest, on_event: Option<ExecEventSink>) -> Result<ExecResult> {
    let resolved_dir = match &req.working_dir {
        Some(d) => paths::resolve(workdir, d, workdir)?,
        None => workdir.to_string(),
    };
    let timeout_ms = req.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
    let argv = req.argv_or_shell(&["/bin/sh", "-c"]);

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .current_dir(&resolved_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command.spawn().map_err(|e| SandboxError::setup_failed(e.to_string()))?;
    let pid = child.id();

    let mut stdout_pipe = child.stdout.take().expect("piped stdout");
    let mut stderr_pipe = child.stderr.take().expect("piped stderr");

    let stdout_sink = on_event.clone();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stdout_pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(s) = &stdout_sink {
                        s(ExecEvent::Stdout(chunk[..n].to_vec()));
                    }
                }
            }
        }
        buf
    });

    let stderr_sink = on_event.clone();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stderr_pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(s) = &stderr_sink {
                        s(ExecEvent::Stderr(chunk[..n].to_vec()));
                    }
                }
            }
        }
        buf
    });

    let wait = child.wait();
    let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), wait).await;

    match outcome {
        Ok(Ok(status)) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            let exit_code = status.code().unwrap_or(-1) as i64;

            let result = ExecResult { stdout, stderr, exit_code };
            if let Some(s) = &on_event {
                s(ExecEvent::Exit(exit_code));
            }
            Ok(result)
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "host exec wait failed");
            Err(SandboxError::exec_transport(e.to_string()))
        }
        Err(_) => {
            tracing::warn!(command = %argv.join(" "), timeout_ms, "host exec timed out");
            kill_process_group(pid);
            stdout_task.abort();
            stderr_task.abort();
            Err(SandboxError::timeout("exec deadline exceeded"))
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Snapshot of the sandbox's open root descriptor (if any) plus the
/// fallback-validator state, handed out fresh by `HostSandbox::fs` on every
/// call so concurrent `Fs` handles all share the one descriptor opened by
/// `Start` rather than each re-opening their own.
struct HostFs {
    workdir: String,
    restrict: bool,
    root: Option<Arc<cap_std::fs::Dir>>,
}

impl HostFs {
    fn validated_path(&self, path: &str) -> Result<PathBuf> {
        let resolved = paths::resolve(&self.workdir, path, &self.workdir)?;

        if self.root.is_some() {
            return Ok(PathBuf::from(resolved));
        }

        // No root descriptor held, either because `restrict` is off or
        // because the workspace was empty at `start()` time: fall back to
        // the textual-resolution validator, which re-checks containment
        // after evaluating symlinks on the candidate and its nearest
        // existing ancestor.
        revalidate_against_symlinks(&self.workdir, &resolved)
    }

    fn relative(&self, absolute: &str) -> String {
        absolute
            .strip_prefix(&self.workdir)
            .unwrap_or(absolute)
            .trim_start_matches('/')
            .to_string()
    }
}

#[async_trait]
impl Fs for HostFs {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let resolved = self.validated_path(path)?;

        if let Some(root) = &self.root {
            let rel = self.relative(resolved.to_string_lossy().as_ref());
            return root.read(rel).map_err(Into::into);
        }
        std::fs::read(resolved).map_err(Into::into)
    }

    async fn write_file(&self, path: &str, data: &[u8], mkdir: bool) -> Result<()> {
        let resolved = self.validated_path(path)?;

        if let Some(root) = &self.root {
            let rel = self.relative(resolved.to_string_lossy().as_ref());
            let rel_path = Path::new(&rel);
            if mkdir {
                if let Some(parent) = rel_path.parent() {
                    if !parent.as_os_str().is_empty() {
                        root.create_dir_all(parent)?;
                    }
                }
            }
            return atomic_write_capstd(root, rel_path, data);
        }

        if mkdir {
            if let Some(parent) = resolved.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        atomic_write_std(&resolved, data)
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let resolved = self.validated_path(path)?;

        if let Some(root) = &self.root {
            let rel = self.relative(resolved.to_string_lossy().as_ref());
            let mut out = Vec::new();
            for entry in root.read_dir(rel)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                out.push(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    is_dir: file_type.is_dir(),
                });
            }
            return Ok(out);
        }

        let mut out = Vec::new();
        for entry in std::fs::read_dir(resolved)? {
            let entry = entry?;
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        Ok(out)
    }
}

/// Write via a temp file in the same directory, fsync it, rename over the
/// destination, then fsync the parent directory so the rename itself is
/// durable.
fn atomic_write_std(dest: &Path, data: &[u8]) -> Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let tmp = parent.join(format!(".{}.tmp.{}", dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(), std::process::id()));

    {
        use std::io::Write;
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, dest)?;
    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn atomic_write_capstd(root: &cap_std::fs::Dir, rel_path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let tmp_name = format!(
        ".{}.tmp.{}",
        rel_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        std::process::id()
    );
    let tmp_path = rel_path.with_file_name(tmp_name);

    {
        let mut f = root.create(&tmp_path)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    root.rename(&tmp_path, root, rel_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(dir: &std::path::Path) -> HostSandbox {
        HostSandbox::new(dir.to_string_lossy().into_owned(), true)
    }

    /// Workspace write-then-read, plus a host-level read of the same file
    /// through a second, independent path.
    #[tokio::test]
    async fn write_then_read_round_trips_and_is_visible_on_host() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path());
        sb.start().await.unwrap();

        let fs = sb.fs();
        fs.write_file("dir/a.txt", &[0x78], true).await.unwrap();

        let read_back = fs.read_file("dir/a.txt").await.unwrap();
        assert_eq!(read_back, vec![0x78]);

        let host_read = std::fs::read(dir.path().join("dir/a.txt")).unwrap();
        assert_eq!(host_read, vec![0x78]);
    }

    /// A lexical path escape is rejected before any filesystem access is
    /// attempted.
    #[tokio::test]
    async fn path_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path());
        sb.start().await.unwrap();

        let err = sb.fs().read_file("../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::AccessDenied);
    }

    /// A symlink planted inside the workspace that points outside it must
    /// not be followed.
    #[tokio::test]
    #[cfg(unix)]
    async fn symlink_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("hostname"), b"evil-host").unwrap();
        std::os::unix::fs::symlink(outside.path().join("hostname"), dir.path().join("link")).unwrap();

        let sb = sandbox(dir.path());
        sb.start().await.unwrap();

        let result = sb.fs().read_file("link").await;
        assert!(result.is_err(), "reading through a symlink that escapes the workspace must fail");
    }

    /// A command that outlives its timeout is killed and reported as a
    /// timeout, not a synthesized exit code.
    #[tokio::test]
    async fn exec_honors_timeout_and_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path());
        sb.start().await.unwrap();

        let start = std::time::Instant::now();
        let result = sb
            .exec(ExecRequest::shell("sleep 10").with_timeout_ms(200))
            .await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, crate::error::ErrorKind::Timeout);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn exec_runs_argv_directly_without_shell() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path());
        sb.start().await.unwrap();

        let result = sb
            .exec(ExecRequest::argv("/bin/echo", vec!["hi".to_string()]))
            .await
            .unwrap();
        assert_eq!(result.stdout_string().trim(), "hi");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn prune_is_idempotent_without_prior_start() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path());
        sb.prune().await.unwrap();
        sb.prune().await.unwrap();
    }

    #[tokio::test]
    async fn unrestricted_mode_falls_back_to_textual_validation() {
        let dir = tempfile::tempdir().unwrap();
        let sb = HostSandbox::new(dir.path().to_string_lossy().into_owned(), false);
        sb.start().await.unwrap();

        sb.fs().write_file("a.txt", b"hello", false).await.unwrap();
        let bytes = sb.fs().read_file("a.txt").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    /// Unrestricted mode holds no root descriptor, but must still apply the
    /// textual-resolution validator's symlink check, not just the lexical one.
    #[tokio::test]
    #[cfg(unix)]
    async fn unrestricted_mode_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("hostname"), b"evil-host").unwrap();
        std::os::unix::fs::symlink(outside.path().join("hostname"), dir.path().join("link")).unwrap();

        let sb = HostSandbox::new(dir.path().to_string_lossy().into_owned(), false);
        sb.start().await.unwrap();

        let result = sb.fs().read_file("link").await;
        assert!(result.is_err(), "unrestricted mode must still reject a symlink escape");
    }
}
