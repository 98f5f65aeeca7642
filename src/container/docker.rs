//! Docker Engine implementation of [`ContainerRuntime`].

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{InspectContainerOptions, LogsOptions};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerStateStatusEnum, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use futures::StreamExt;

use crate::container::{
    ChunkStream, ContainerRuntime, ContainerSnapshot, EventKind, EventStream, ExecAttach,
    ExecOutput, LifecycleState, LineStream, LogOptions, RuntimeEvent, lines_from_chunks,
    normalize_name, parse_started_at,
};
use crate::error::ContainerError;

/// Connect to the local Docker daemon and verify it responds.
///
/// Honors `DOCKER_HOST`; otherwise uses the platform's default socket. When
/// the default socket is absent, the rootless and Docker Desktop socket
/// locations under `$HOME` and `$XDG_RUNTIME_DIR` are tried.
pub async fn connect_docker() -> Result<Docker, ContainerError> {
    let mut last_error = match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.ping().await {
            Ok(_) => return Ok(docker),
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };

    for socket in fallback_sockets() {
        if !std::path::Path::new(&socket).exists() {
            continue;
        }
        match Docker::connect_with_socket(&socket, 120, bollard::API_DEFAULT_VERSION) {
            Ok(docker) => match docker.ping().await {
                Ok(_) => {
                    tracing::debug!(socket = %socket, "Connected to Docker via fallback socket");
                    return Ok(docker);
                }
                Err(e) => last_error = e.to_string(),
            },
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(ContainerError::DockerNotAvailable { reason: last_error })
}

fn fallback_sockets() -> Vec<String> {
    let mut sockets = Vec::new();
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        sockets.push(format!("{runtime_dir}/docker.sock"));
    }
    if let Ok(home) = std::env::var("HOME") {
        sockets.push(format!("{home}/.docker/run/docker.sock"));
        sockets.push(format!("{home}/.docker/desktop/docker.sock"));
    }
    sockets
}

/// [`ContainerRuntime`] backed by the Docker Engine API.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect with [`connect_docker`].
    pub async fn connect() -> Result<Self, ContainerError> {
        Ok(Self::new(connect_docker().await?))
    }

    fn map_error(name: &str, err: BollardError) -> ContainerError {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404, ..
            } => ContainerError::NotFound {
                name: name.to_string(),
            },
            other => ContainerError::Runtime {
                name: name.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

fn map_state(status: Option<ContainerStateStatusEnum>) -> LifecycleState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => LifecycleState::Created,
        Some(ContainerStateStatusEnum::RUNNING) => LifecycleState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => LifecycleState::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => LifecycleState::Restarting,
        Some(ContainerStateStatusEnum::EXITED) => LifecycleState::Exited,
        Some(ContainerStateStatusEnum::DEAD) => LifecycleState::Dead,
        _ => LifecycleState::Unknown,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<ContainerSnapshot, ContainerError> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Self::map_error(name, e))?;

        let (state, started_at) = match info.state {
            Some(state) => (
                map_state(state.status),
                parse_started_at(state.started_at.as_deref()),
            ),
            None => (LifecycleState::Unknown, None),
        };

        Ok(ContainerSnapshot {
            id: info.id.unwrap_or_default(),
            name: info
                .name
                .as_deref()
                .map(normalize_name)
                .unwrap_or_else(|| name.to_string()),
            state,
            env: info.config.and_then(|c| c.env).unwrap_or_default(),
            started_at,
        })
    }

    async fn logs(&self, name: &str, options: LogOptions) -> Result<LineStream, ContainerError> {
        // Surface a missing container as NotFound up front; the log stream
        // itself would only fail on first poll.
        self.inspect(name).await?;

        let opts = LogsOptions::<String> {
            follow: options.follow,
            stdout: true,
            stderr: true,
            since: options.since.as_unix(),
            tail: options.tail.as_docker_arg(),
            ..Default::default()
        };

        let owned = name.to_string();
        let chunks: ChunkStream = Box::pin(
            self.docker
                .logs(name, Some(opts))
                .map(move |item| {
                    item.map(|out| out.into_bytes())
                        .map_err(|e| Self::map_error(&owned, e))
                }),
        );

        Ok(lines_from_chunks(chunks))
    }

    async fn exec(&self, name: &str, cmd: &[String]) -> Result<ExecOutput, ContainerError> {
        let created = self
            .docker
            .create_exec(
                name,
                CreateExecOptions::<String> {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::map_error(name, e))?;

        let mut output = Vec::new();
        match self
            .docker
            .start_exec(&created.id, None::<StartExecOptions>)
            .await
            .map_err(|e| Self::map_error(name, e))?
        {
            StartExecResults::Attached {
                output: mut stream, ..
            } => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| ContainerError::ExecFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })?;
                    output.extend_from_slice(&chunk.into_bytes());
                }
            }
            StartExecResults::Detached => {
                return Err(ContainerError::ExecFailed {
                    name: name.to_string(),
                    reason: "exec started detached, no output attached".to_string(),
                });
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(|e| Self::map_error(name, e))?;

        Ok(ExecOutput {
            output: String::from_utf8_lossy(&output).to_string(),
            exit_code: inspected.exit_code.unwrap_or(-1),
        })
    }

    async fn exec_attach(&self, name: &str, cmd: &[String]) -> Result<ExecAttach, ContainerError> {
        let created = self
            .docker
            .create_exec(
                name,
                CreateExecOptions::<String> {
                    cmd: Some(cmd.to_vec()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::map_error(name, e))?;

        tracing::info!(container = %name, exec_id = %created.id, "Created interactive exec");

        let options = StartExecOptions {
            detach: false,
            tty: true,
            ..Default::default()
        };
        match self
            .docker
            .start_exec(&created.id, Some(options))
            .await
            .map_err(|e| Self::map_error(name, e))?
        {
            StartExecResults::Attached { output, input } => {
                let owned = name.to_string();
                let output: ChunkStream = Box::pin(output.map(move |item| {
                    item.map(|out| out.into_bytes())
                        .map_err(|e| ContainerError::ExecFailed {
                            name: owned.clone(),
                            reason: e.to_string(),
                        })
                }));
                Ok(ExecAttach {
                    id: created.id,
                    output,
                    input,
                })
            }
            StartExecResults::Detached => Err(ContainerError::ExecFailed {
                name: name.to_string(),
                reason: "exec started detached, cannot attach".to_string(),
            }),
        }
    }

    async fn events(&self) -> Result<EventStream, ContainerError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);

        let stream = self
            .docker
            .events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }))
            .filter_map(|item| async move {
                match item {
                    Ok(msg) => {
                        if msg.typ != Some(EventMessageTypeEnum::CONTAINER) {
                            return None;
                        }
                        let action = msg.action?;
                        let actor = msg.actor?;
                        let container_name = actor
                            .attributes
                            .as_ref()
                            .and_then(|attrs| attrs.get("name"))
                            .map(|n| normalize_name(n));
                        Some(Ok(RuntimeEvent {
                            kind: EventKind::from_action(&action),
                            container_id: actor.id.unwrap_or_default(),
                            container_name,
                        }))
                    }
                    Err(e) => Some(Err(ContainerError::Runtime {
                        name: "events".to_string(),
                        reason: e.to_string(),
                    })),
                }
            });

        Ok(Box::pin(stream))
    }
}
