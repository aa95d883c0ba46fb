//! Container engine seam: the operations `ContainerSandbox` needs from a
//! Docker-compatible engine, abstracted so a mock can stand in for tests
//! that don't have a live daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures::StreamExt;

use crate::error::{Result, SandboxError};

/// One chunk of a demuxed exec output stream.
#[derive(Debug, Clone)]
pub enum ExecChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Spec for creating a container, already fully resolved (binds validated,
/// env sanitized) by the caller.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub workdir: String,
    pub user: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub binds: Vec<String>,
    pub tmpfs: HashMap<String, String>,
    pub network_mode: String,
    pub cap_drop: Vec<String>,
    pub dns: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub security_opt: Vec<String>,
    pub pids_limit: Option<i64>,
    pub memory_bytes: Option<i64>,
    pub memory_swap_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    /// `(name, soft, hard)` ulimits, e.g. `("nofile", 1024, 2048)`.
    pub ulimits: Vec<(String, i64, i64)>,
}

/// Engine-level view of an exec's terminal state.
#[derive(Debug, Clone, Copy)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Abstraction over the Docker-compatible engine operations the sandbox
/// layer needs. A real implementation wraps `bollard::Docker`; tests use
/// `MockEngine` instead of requiring a live daemon.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn image_exists(&self, image: &str) -> Result<bool>;
    async fn pull_image(&self, image: &str) -> Result<()>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str) -> Result<()>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;
    async fn container_running(&self, id: &str) -> Result<bool>;
    async fn copy_to_container(&self, id: &str, dest_dir: &str, tar_bytes: Vec<u8>) -> Result<()>;
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>>;

    /// Start an exec and stream its demuxed output through `on_chunk`,
    /// returning once the process attachment completes. Callers poll
    /// `exec_status` afterwards for the final exit code. When `stdin` is
    /// `Some`, its bytes are written to the exec's attached input and the
    /// write side is then half-closed so the child sees EOF.
    async fn exec_start(
        &self,
        id: &str,
        cmd: Vec<String>,
        workdir: Option<String>,
        user: Option<String>,
        stdin: Option<Vec<u8>>,
        on_chunk: Box<dyn FnMut(ExecChunk) + Send>,
    ) -> Result<String>;

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus>;
}

/// `bollard`-backed implementation talking to a real (or rootless) Docker
/// engine over its local socket.
pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::unavailable(format!("failed to connect to container engine: {}", e)))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for BollardEngine {
    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(item) = stream.next().await {
            item?;
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mounts: Vec<Mount> = spec
            .tmpfs
            .iter()
            .map(|(target, size_opt)| Mount {
                target: Some(target.clone()),
                typ: Some(MountTypeEnum::TMPFS),
                tmpfs_options: if size_opt.is_empty() {
                    None
                } else {
                    Some(bollard::models::MountTmpfsOptions {
                        size_bytes: size_opt.parse::<i64>().ok(),
                        mode: None,
                    })
                },
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            binds: Some(spec.binds.clone()),
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            network_mode: Some(spec.network_mode.clone()),
            cap_drop: Some(spec.cap_drop.clone()),
            dns: if spec.dns.is_empty() { None } else { Some(spec.dns.clone()) },
            extra_hosts: if spec.extra_hosts.is_empty() {
                None
            } else {
                Some(spec.extra_hosts.clone())
            },
            security_opt: if spec.security_opt.is_empty() {
                None
            } else {
                Some(spec.security_opt.clone())
            },
            pids_limit: spec.pids_limit,
            memory: spec.memory_bytes,
            memory_swap: spec.memory_swap_bytes,
            nano_cpus: spec.nano_cpus,
            ulimits: if spec.ulimits.is_empty() {
                None
            } else {
                Some(
                    spec.ulimits
                        .iter()
                        .map(|(name, soft, hard)| bollard::models::ResourcesUlimits {
                            name: Some(name.clone()),
                            soft: Some(*soft),
                            hard: Some(*hard),
                        })
                        .collect(),
                )
            },
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.workdir.clone()),
            user: Some(spec.user.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        });

        let response = self.docker.create_container(options, config).await?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(Into::into)
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.docker.stop_container(id, None).await.map_err(Into::into)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = Some(RemoveContainerOptions {
            force,
            ..Default::default()
        });
        match self.docker.remove_container(id, options).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn container_running(&self, id: &str) -> Result<bool> {
        let info = self.docker.inspect_container(id, None).await?;
        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn copy_to_container(&self, id: &str, dest_dir: &str, tar_bytes: Vec<u8>) -> Result<()> {
        let options = bollard::container::UploadToContainerOptions {
            path: dest_dir,
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), tar_bytes.into())
            .await
            .map_err(Into::into)
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let options = bollard::container::DownloadFromContainerOptions { path };
        let mut stream = self.docker.download_from_container(id, Some(options));
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf)
    }

    async fn exec_start(
        &self,
        id: &str,
        cmd: Vec<String>,
        workdir: Option<String>,
        user: Option<String>,
        stdin: Option<Vec<u8>>,
        mut on_chunk: Box<dyn FnMut(ExecChunk) + Send>,
    ) -> Result<String> {
        let create_options = CreateExecOptions {
            cmd: Some(cmd),
            working_dir: workdir,
            user,
            attach_stdin: Some(stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(id, create_options).await?;

        let start_options = StartExecOptions {
            detach: false,
            ..Default::default()
        };
        match self.docker.start_exec(&exec.id, Some(start_options)).await? {
            StartExecResults::Attached { mut output, mut input } => {
                if let Some(bytes) = stdin {
                    use tokio::io::AsyncWriteExt;
                    input.write_all(&bytes).await.map_err(|e| SandboxError::io(e.to_string()))?;
                    input.shutdown().await.map_err(|e| SandboxError::io(e.to_string()))?;
                }

                while let Some(item) = output.next().await {
                    match item? {
                        bollard::container::LogOutput::StdOut { message } => {
                            on_chunk(ExecChunk::Stdout(message.to_vec()));
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            on_chunk(ExecChunk::Stderr(message.to_vec()));
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        Ok(exec.id)
    }

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        Ok(ExecStatus {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
        })
    }
}

/// In-memory engine used by tests: tracks created/started/removed
/// containers and replays a scripted exec outcome, without ever touching a
/// real Docker socket. Public (not `cfg(test)`-gated) so both this crate's
/// unit tests and its `tests/` integration suite can depend on it without a
/// live container engine.
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockEngine {
        pub images: Mutex<Vec<String>>,
        pub containers: Mutex<Vec<String>>,
        pub running: Mutex<Vec<String>>,
        pub last_exec_cmd: Mutex<Option<Vec<String>>>,
        pub last_exec_user: Mutex<Option<String>>,
        pub last_exec_stdin: Mutex<Option<Vec<u8>>>,
        pub scripted_stdout: Mutex<Vec<u8>>,
        pub scripted_exit_code: Mutex<i64>,
        pub fail_ping: Mutex<bool>,
        /// Ordered log of lifecycle calls (`"create:<name>"`, `"remove:<name>"`,
        /// `"start:<name>"`, `"stop:<name>"`), for tests that assert a
        /// container was restarted in place rather than rebuilt.
        pub calls: Mutex<Vec<String>>,
    }

    impl MockEngine {
        pub fn with_image(image: &str) -> Self {
            let engine = Self::default();
            engine.images.lock().unwrap().push(image.to_string());
            engine
        }
    }

    #[async_trait]
    impl ContainerEngine for MockEngine {
        async fn ping(&self) -> Result<()> {
            if *self.fail_ping.lock().unwrap() {
                return Err(SandboxError::unavailable("mock engine unreachable"));
            }
            Ok(())
        }

        async fn image_exists(&self, image: &str) -> Result<bool> {
            Ok(self.images.lock().unwrap().iter().any(|i| i == image))
        }

        async fn pull_image(&self, image: &str) -> Result<()> {
            self.images.lock().unwrap().push(image.to_string());
            Ok(())
        }

        async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
            self.containers.lock().unwrap().push(spec.name.clone());
            self.calls.lock().unwrap().push(format!("create:{}", spec.name));
            Ok(spec.name.clone())
        }

        async fn start_container(&self, id: &str) -> Result<()> {
            self.running.lock().unwrap().push(id.to_string());
            self.calls.lock().unwrap().push(format!("start:{}", id));
            Ok(())
        }

        async fn stop_container(&self, id: &str) -> Result<()> {
            self.running.lock().unwrap().retain(|c| c != id);
            self.calls.lock().unwrap().push(format!("stop:{}", id));
            Ok(())
        }

        async fn remove_container(&self, id: &str, _force: bool) -> Result<()> {
            self.containers.lock().unwrap().retain(|c| c != id);
            self.running.lock().unwrap().retain(|c| c != id);
            self.calls.lock().unwrap().push(format!("remove:{}", id));
            Ok(())
        }

        async fn container_running(&self, id: &str) -> Result<bool> {
            Ok(self.running.lock().unwrap().iter().any(|c| c == id))
        }

        async fn copy_to_container(&self, _id: &str, _dest_dir: &str, _tar_bytes: Vec<u8>) -> Result<()> {
            Ok(())
        }

        async fn copy_from_container(&self, _id: &str, _path: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn exec_start(
            &self,
            _id: &str,
            cmd: Vec<String>,
            _workdir: Option<String>,
            user: Option<String>,
            stdin: Option<Vec<u8>>,
            mut on_chunk: Box<dyn FnMut(ExecChunk) + Send>,
        ) -> Result<String> {
            *self.last_exec_cmd.lock().unwrap() = Some(cmd);
            *self.last_exec_user.lock().unwrap() = user;
            *self.last_exec_stdin.lock().unwrap() = stdin;
            let stdout = self.scripted_stdout.lock().unwrap().clone();
            if !stdout.is_empty() {
                on_chunk(ExecChunk::Stdout(stdout));
            }
            // Real engines (Docker's exec-create) hand back a fresh id per
            // call; mint one here too so a test juggling several in-flight
            // execs can't mistake one's status for another's.
            Ok(format!("mock-exec-{}", uuid::Uuid::new_v4()))
        }

        async fn exec_status(&self, _exec_id: &str) -> Result<ExecStatus> {
            Ok(ExecStatus {
                running: false,
                exit_code: Some(*self.scripted_exit_code.lock().unwrap()),
            })
        }
    }
}
