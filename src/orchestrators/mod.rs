/// Orchestrator drivers
///
/// Every supported orchestrator exposes the same capability set: discover
/// volumes, find the running containers mounting one, exec into them, and
/// run a short-lived agent pinned next to the volume.

pub mod cattle;
pub mod docker;
pub mod kubernetes;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::filters::Filters;
use crate::core::volume::{MountedVolume, Volume};
use crate::error::{BivacError, Result};

pub use cattle::{CattleConfig, CattleOrchestrator};
pub use docker::{DockerConfig, DockerOrchestrator};
pub use kubernetes::{KubernetesConfig, KubernetesOrchestrator};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prefix namespacing the volume's remote repository
    fn path(&self, volume: &Volume) -> String;

    /// Discover volumes and keep the ones `filters` accepts
    async fn get_volumes(&self, filters: &Filters) -> Result<Vec<Volume>>;

    /// Running containers mounting `volume`, with the mount path in each
    async fn get_containers_mounting_volume(&self, volume: &Volume) -> Result<Vec<MountedVolume>>;

    /// Run `argv` inside an existing container and return its stdout
    async fn container_exec(&self, mounted: &MountedVolume, argv: &[String]) -> Result<String>;

    /// Run a short-lived agent mounting `volume` and wait for it to finish.
    /// Returns whether the workload succeeded and its captured output.
    async fn deploy_agent(
        &self,
        image: &str,
        argv: &[String],
        env: &[(String, String)],
        volume: &Volume,
    ) -> Result<(bool, String)>;

    async fn is_node_available(&self, _host: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Connection settings of every supported orchestrator
#[derive(Debug, Clone, Default)]
pub struct OrchestratorsConfig {
    pub docker: DockerConfig,
    pub kubernetes: KubernetesConfig,
    pub cattle: CattleConfig,
}

/// Orchestrator named `name`, or the one Bivac runs on when `name` is empty
pub async fn get_orchestrator(
    name: Option<&str>,
    config: &OrchestratorsConfig,
) -> Result<Arc<dyn Orchestrator>> {
    let orchestrator: Arc<dyn Orchestrator> = match name.filter(|n| !n.is_empty()) {
        Some(name) => {
            debug!("Choosing orchestrator based on configuration...");
            match name {
                "docker" => Arc::new(DockerOrchestrator::new(&config.docker).await?),
                "kubernetes" => Arc::new(KubernetesOrchestrator::new(&config.kubernetes).await?),
                "cattle" => Arc::new(CattleOrchestrator::new(&config.cattle)?),
                other => return Err(BivacError::UnknownOrchestrator(other.to_string())),
            }
        }
        None => {
            debug!("Trying to detect orchestrator based on environment...");
            if cattle::detect().await {
                Arc::new(CattleOrchestrator::new(&config.cattle)?)
            } else if kubernetes::detect() {
                Arc::new(KubernetesOrchestrator::new(&config.kubernetes).await?)
            } else if docker::detect(&config.docker).await {
                Arc::new(DockerOrchestrator::new(&config.docker).await?)
            } else {
                return Err(BivacError::NoOrchestrator);
            }
        }
    };

    info!("Using orchestrator: {}", orchestrator.name());
    Ok(orchestrator)
}

/// Environment passed to agents: only the variables configuring the
/// backup engine, its storage backends and Bivac itself
pub const AGENT_ENV_PREFIXES: [&str; 9] = [
    "RESTIC_", "AWS_", "B2_", "AZURE_", "GOOGLE_", "OS_", "ST_", "RCLONE_", "BIVAC_",
];

pub fn agent_env<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: Vec<(String, String)> = vars
        .into_iter()
        .filter(|(k, _)| AGENT_ENV_PREFIXES.iter().any(|p| k.starts_with(p)))
        .collect();
    env.sort();
    env
}
