//! Container lifecycle management: create/find/start/stop/delete per-user
//! containers addressed by a human-chosen logical name.
//!
//! Containers are tagged with `user_id` / `container_name` / `uid` labels;
//! label filtering is the only index, so lookups always go to the engine.
//! The engine-level name is a random UUID to keep the global namespace
//! collision-free while logical names stay unique only per user.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions, LogOutput,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::ContainerSummary;
use bollard::Docker;
use chrono::{DateTime, Utc};
use dockyard_common::{ContainerRecord, ContainerStatus, ContainerView, Error, Result};
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Settings;

pub(crate) const LABEL_USER: &str = "user_id";
pub(crate) const LABEL_NAME: &str = "container_name";
pub(crate) const LABEL_UID: &str = "uid";

const ALLOWED_IMAGES: [&str; 4] = ["ubuntu", "debian", "centos", "alpine"];

/// `StartedAt` value Docker reports for containers that never ran.
const ENGINE_ZERO_TIME: &str = "0001-01-01T00:00:00Z";

pub struct SandboxManager {
    pub(crate) docker: Arc<Docker>,
    pub(crate) settings: Settings,
}

/// Collected result of a one-shot in-container command.
pub(crate) struct ExecOutcome {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl SandboxManager {
    pub fn new(docker: Arc<Docker>, settings: Settings) -> Self {
        Self { docker, settings }
    }

    /// Connects to the engine using local defaults (`DOCKER_HOST` honored).
    pub fn connect(settings: Settings) -> Result<Self> {
        let docker = Docker::connect_with_defaults().map_err(engine_error)?;
        Ok(Self::new(Arc::new(docker), settings))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    /// Finds the engine container tagged with this user's id and logical
    /// name. Returns the first match; duplicates indicate inconsistent
    /// labels and carry no defined resolution order.
    pub async fn find_by_name(&self, user: &str, name: &str) -> Result<Option<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("{LABEL_USER}={user}"),
                format!("{LABEL_NAME}={name}"),
            ],
        );
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(engine_error)?;
        Ok(containers.into_iter().next())
    }

    /// Like [`find_by_name`](Self::find_by_name) but absence is an error.
    pub(crate) async fn resolve(&self, user: &str, name: &str) -> Result<ContainerSummary> {
        self.find_by_name(user, name).await?.ok_or_else(|| {
            Error::NotFound(format!("no container named '{name}' for user {user}"))
        })
    }

    #[instrument(skip(self))]
    pub async fn create(&self, user: &str, image: &str, name: &str) -> Result<ContainerRecord> {
        if !valid_logical_name(name) {
            return Err(Error::Validation(
                "container name must be non-empty and contain only letters, numbers, dashes, and underscores".to_string(),
            ));
        }
        if !ALLOWED_IMAGES.contains(&image) {
            return Err(Error::Validation(format!(
                "unsupported image '{image}', expected one of: ubuntu, debian, centos, alpine"
            )));
        }
        if self.find_by_name(user, name).await?.is_some() {
            return Err(Error::Conflict(format!(
                "container '{name}' already exists for user {user}"
            )));
        }

        let engine_name = Uuid::new_v4().to_string();
        let labels = HashMap::from([
            (LABEL_USER.to_string(), user.to_string()),
            (LABEL_NAME.to_string(), name.to_string()),
            (LABEL_UID.to_string(), engine_name.clone()),
        ]);
        let config = Config {
            image: Some(image.to_string()),
            tty: Some(true),
            labels: Some(labels),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: engine_name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(engine_error)?;
        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(engine_error)?;

        self.ensure_user(&created.id, user).await?;
        if let Err(err) = self.rebalance(user).await {
            warn!(%user, error = %err, "post-create rebalance failed");
        }

        let inspect = self
            .docker
            .inspect_container(&created.id, None)
            .await
            .map_err(engine_error)?;
        let state = inspect.state.unwrap_or_default();
        info!(container = %created.id, %user, %name, %image, "created sandbox container");

        Ok(ContainerRecord {
            id: created.id,
            engine_name,
            user: user.to_string(),
            name: name.to_string(),
            image: image.to_string(),
            status: state
                .status
                .map(|s| ContainerStatus::from_engine(&s.to_string()))
                .unwrap_or(ContainerStatus::Running),
            created_at: inspect.created.as_deref().and_then(parse_engine_time),
            last_started: state.started_at.as_deref().and_then(parse_engine_time),
        })
    }

    /// Makes sure an in-container account named after the external user
    /// exists, with a home directory and login shell. Idempotent.
    pub(crate) async fn ensure_user(&self, container_id: &str, user: &str) -> Result<()> {
        let probe = self
            .exec_collect(
                container_id,
                vec!["id".into(), "-u".into(), user.to_string()],
                Some("root"),
                None,
            )
            .await?;
        if probe.exit_code == 0 {
            debug!(%user, container = %container_id, "account already present");
            return Ok(());
        }

        let added = self
            .exec_collect(
                container_id,
                vec![
                    "useradd".into(),
                    "-U".into(),
                    "-m".into(),
                    "-s".into(),
                    "/bin/bash".into(),
                    user.to_string(),
                ],
                Some("root"),
                None,
            )
            .await?;
        if added.exit_code == 0 {
            info!(%user, container = %container_id, "created in-container account");
        } else {
            warn!(
                %user,
                container = %container_id,
                stderr = %String::from_utf8_lossy(&added.stderr),
                "useradd failed; image may not ship it"
            );
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn start(&self, user: &str, name: &str) -> Result<()> {
        let summary = self.resolve(user, name).await?;
        let id = summary_id(&summary)?;
        if summary.state.as_deref() == Some("running") {
            debug!(container = %id, %name, "already running");
            return Ok(());
        }
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(engine_error)?;
        info!(container = %id, %user, %name, "started container");
        if let Err(err) = self.rebalance(user).await {
            warn!(%user, error = %err, "post-start rebalance failed");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, user: &str, name: &str) -> Result<()> {
        let summary = self.resolve(user, name).await?;
        let id = summary_id(&summary)?;
        if summary.state.as_deref() != Some("running") {
            debug!(container = %id, %name, "already stopped");
            return Ok(());
        }
        self.docker
            .stop_container(id, None)
            .await
            .map_err(engine_error)?;
        info!(container = %id, %user, %name, "stopped container");
        if let Err(err) = self.rebalance(user).await {
            warn!(%user, error = %err, "post-stop rebalance failed");
        }
        Ok(())
    }

    /// Force-removes the container regardless of running state.
    #[instrument(skip(self))]
    pub async fn delete(&self, user: &str, name: &str) -> Result<()> {
        let summary = self.resolve(user, name).await?;
        let id = summary_id(&summary)?;
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(engine_error)?;
        info!(container = %id, %user, %name, "deleted container");
        if let Err(err) = self.rebalance(user).await {
            warn!(%user, error = %err, "post-delete rebalance failed");
        }
        Ok(())
    }

    /// Projects every container labeled with this user, running or not.
    /// Any engine failure fails the whole call; no partial listings.
    #[instrument(skip(self))]
    pub async fn list_for_user(&self, user: &str) -> Result<Vec<ContainerView>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{LABEL_USER}={user}")]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(engine_error)?;

        let mut views = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let id = summary_id(&summary)?.to_string();
            let inspect = self
                .docker
                .inspect_container(&id, None)
                .await
                .map_err(engine_error)?;
            let state = inspect.state.unwrap_or_default();

            let image_ref = inspect
                .config
                .as_ref()
                .and_then(|c| c.image.clone())
                .or(summary.image)
                .unwrap_or_default();
            let image_details = self
                .docker
                .inspect_image(&image_ref)
                .await
                .map_err(engine_error)?;

            let name = summary
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_NAME).cloned())
                .unwrap_or_else(|| "unknown".to_string());

            views.push(ContainerView {
                id,
                name,
                status: state
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                image: image_details
                    .repo_tags
                    .and_then(|tags| tags.into_iter().next())
                    .unwrap_or_else(|| "unknown".to_string()),
                os: image_details.os.unwrap_or_else(|| "unknown".to_string()),
                created: inspect.created.as_deref().and_then(parse_engine_time),
                last_started: state.started_at.as_deref().and_then(parse_engine_time),
                running: state.running.unwrap_or(false),
            });
        }
        Ok(views)
    }

    /// Runs a command inside the container and collects exit code plus
    /// both output streams.
    pub(crate) async fn exec_collect(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        user: Option<&str>,
        working_dir: Option<String>,
    ) -> Result<ExecOutcome> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    cmd: Some(cmd),
                    user: user.map(str::to_string),
                    working_dir,
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(engine_error)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(engine_error)?
        {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(engine_error)? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        stdout.extend_from_slice(&message);
                    }
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(engine_error)?;
        Ok(ExecOutcome {
            exit_code: inspect.exit_code.unwrap_or_default(),
            stdout,
            stderr,
        })
    }
}

/// Splits engine failures into the transport/application halves of the
/// taxonomy: the daemon answered with an error vs. never answered at all.
pub(crate) fn engine_error(err: BollardError) -> Error {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => Error::EngineApplication(format!("{message} (status {status_code})")),
        other => Error::EngineTransport(other.to_string()),
    }
}

pub(crate) fn summary_id(summary: &ContainerSummary) -> Result<&str> {
    summary
        .id
        .as_deref()
        .ok_or_else(|| Error::Internal("engine returned a container without an id".to_string()))
}

pub(crate) fn valid_logical_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub(crate) fn parse_engine_time(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() || raw == ENGINE_ZERO_TIME {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
