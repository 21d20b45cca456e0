/// Docker orchestrator
///
/// Volumes are the daemon's named volumes. Agents run as plain containers
/// mounting the volume, on the same daemon as the manager.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum};
use bollard::volume::ListVolumesOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::{StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

use super::Orchestrator;
use crate::core::filters::Filters;
use crate::core::volume::{MountedVolume, Volume};
use crate::error::{BivacError, Result};
use crate::utils::helpers::{agent_name, local_hostname};

pub const DEFAULT_ENDPOINT: &str = "unix:///var/run/docker.sock";

const CONNECT_TIMEOUT_SECS: u64 = 120;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub endpoint: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

fn connect(endpoint: &str) -> Result<Docker> {
    let docker = match endpoint.strip_prefix("unix://") {
        Some(path) => Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?,
        None => Docker::connect_with_http(endpoint, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?,
    };
    Ok(docker)
}

/// True when a Docker daemon answers on the configured endpoint
pub async fn detect(config: &DockerConfig) -> bool {
    match connect(&config.endpoint) {
        Ok(docker) => docker.ping().await.is_ok(),
        Err(_) => false,
    }
}

pub struct DockerOrchestrator {
    docker: Docker,
    hostname: String,
}

impl DockerOrchestrator {
    pub async fn new(config: &DockerConfig) -> Result<Self> {
        let docker = connect(&config.endpoint)?;
        let info = docker.info().await?;
        let hostname = info.name.unwrap_or_else(local_hostname);
        Ok(Self { docker, hostname })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        debug!(image, "Pulling agent image");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image,
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    /// Start the agent, wait for it to exit and collect its output
    async fn run_to_completion(&self, id: &str) -> Result<(bool, String)> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        let exit_code = loop {
            let inspect = self
                .docker
                .inspect_container(id, None::<InspectContainerOptions>)
                .await?;
            let state = inspect.state.unwrap_or_default();
            if state.status == Some(ContainerStateStatusEnum::EXITED) {
                break state.exit_code.unwrap_or(-1);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        let logs: Vec<LogOutput> = self
            .docker
            .logs(
                id,
                Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .try_collect()
            .await?;
        let output: String = logs.iter().map(|l| l.to_string()).collect();

        Ok((exit_code == 0, output))
    }
}

/// Container definition of an agent
pub(crate) fn agent_config(
    image: &str,
    argv: &[String],
    env: &[(String, String)],
    volume: &Volume,
) -> Config<String> {
    Config {
        image: Some(image.to_string()),
        cmd: Some(argv.to_vec()),
        env: Some(env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        host_config: Some(HostConfig {
            mounts: Some(vec![Mount {
                typ: Some(MountTypeEnum::VOLUME),
                source: Some(volume.name.clone()),
                target: Some(volume.mountpoint.clone()),
                read_only: Some(volume.read_only),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn path(&self, _volume: &Volume) -> String {
        self.hostname.clone()
    }

    async fn get_volumes(&self, filters: &Filters) -> Result<Vec<Volume>> {
        let list = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await?;

        let mut volumes = Vec::new();
        for listed in list.volumes.unwrap_or_default() {
            let inspected = self.docker.inspect_volume(&listed.name).await?;
            let labels: BTreeMap<String, String> = inspected.labels.into_iter().collect();
            if !filters.is_accepted(&inspected.name, &labels) {
                continue;
            }

            let mut v = Volume::new(inspected.name.clone(), inspected.name.clone());
            v.mountpoint = inspected.mountpoint;
            v.host_bind = self.hostname.clone();
            v.hostname = self.hostname.clone();
            v.namespace = self.hostname.clone();
            v.labels = labels;
            volumes.push(v);
        }
        Ok(volumes)
    }

    async fn get_containers_mounting_volume(&self, volume: &Volume) -> Result<Vec<MountedVolume>> {
        let mut filters = HashMap::new();
        filters.insert("volume".to_string(), vec![volume.name.clone()]);
        filters.insert("status".to_string(), vec!["running".to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut mounted = Vec::new();
        for container in containers {
            let id = container.id.unwrap_or_default();
            for mount in container.mounts.unwrap_or_default() {
                if mount.name.as_deref() != Some(volume.name.as_str()) {
                    continue;
                }
                mounted.push(MountedVolume {
                    pod_id: None,
                    container_id: id.clone(),
                    host_id: self.hostname.clone(),
                    volume: volume.clone(),
                    path: mount.destination.unwrap_or_default(),
                });
            }
        }
        Ok(mounted)
    }

    async fn container_exec(&self, mounted: &MountedVolume, argv: &[String]) -> Result<String> {
        let exec = self
            .docker
            .create_exec(
                &mounted.container_id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(msg) = output.next().await {
                if let LogOutput::StdOut { message } = msg? {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        match inspect.exit_code {
            Some(0) | None => Ok(stdout),
            Some(code) => Err(BivacError::Orchestrator(format!(
                "command exited with code {} in container {}",
                code, mounted.container_id
            ))),
        }
    }

    async fn deploy_agent(
        &self,
        image: &str,
        argv: &[String],
        env: &[(String, String)],
        volume: &Volume,
    ) -> Result<(bool, String)> {
        self.pull_image(image).await?;

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: agent_name(),
                    platform: None,
                }),
                agent_config(image, argv, env, volume),
            )
            .await?;

        let result = self.run_to_completion(&created.id).await;

        if let Err(e) = self
            .docker
            .remove_container(
                &created.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(volume = %volume.name, "Failed to remove agent container {}: {}", created.id, e);
        }

        result
    }
}
