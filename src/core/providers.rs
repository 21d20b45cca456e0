/// Workload providers
///
/// A provider describes how to prepare a volume for backup (dump a database
/// into `backup_dir`, for instance) and how to clean up afterwards. Providers
/// are detected by probing a container that mounts the volume.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::core::volume::Volume;
use crate::error::{BivacError, Result};
use crate::orchestrators::Orchestrator;

/// Used when no providers file is found
pub const DEFAULT_PROVIDERS: &str = include_str!("../../providers-config.default.toml");

pub const DEFAULT_PROVIDER_NAME: &str = "Default";

/// Log keys of the hook commands
pub const PRE_CMD_KEY: &str = "precmd";
pub const POST_CMD_KEY: &str = "postcmd";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Provider {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub pre_cmd: String,
    #[serde(default)]
    pub post_cmd: String,
    #[serde(default)]
    pub detect_cmd: String,
    #[serde(default)]
    pub backup_dir: String,
    #[serde(default)]
    pub restore_pre_cmd: String,
    #[serde(default)]
    pub restore_post_cmd: String,
}

impl Provider {
    /// No detection, no hooks, backs up the whole volume
    pub fn default_provider() -> Self {
        Self {
            name: DEFAULT_PROVIDER_NAME.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    providers: BTreeMap<String, Provider>,
}

#[derive(Debug, Clone, Default)]
pub struct Providers {
    providers: BTreeMap<String, Provider>,
}

impl Providers {
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ProvidersFile =
            toml::from_str(content).map_err(|e| BivacError::Providers(e.to_string()))?;
        let providers = file
            .providers
            .into_iter()
            .map(|(name, mut p)| {
                p.name = name.clone();
                (name, p)
            })
            .collect();
        Ok(Self { providers })
    }

    /// Load providers from `path`, falling back to the built-in table when
    /// the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "Providers file {} not found, using built-in providers",
                path.display()
            );
            return Self::from_toml(DEFAULT_PROVIDERS);
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn get(&self, name: &str) -> Option<&Provider> {
        self.providers.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    /// `(d1 && echo 'n1') || (d2 && echo 'n2') || ... || true`
    pub fn detection_command(&self) -> String {
        let mut parts: Vec<String> = self
            .providers
            .values()
            .filter(|p| !p.detect_cmd.is_empty())
            .map(|p| format!("({} && echo '{}')", p.detect_cmd, p.name))
            .collect();
        parts.push("true".to_string());
        parts.join(" || ")
    }

    /// Detect the workload using `volume`. Falls back to the Default
    /// provider when no container mounts it or no detection matches.
    pub async fn get_provider(&self, orchestrator: &dyn Orchestrator, volume: &Volume) -> Provider {
        let containers = match orchestrator.get_containers_mounting_volume(volume).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(volume = %volume.name, "Failed to list containers mounting volume: {}", e);
                return Provider::default_provider();
            }
        };

        let detection = self.detection_command();
        for container in &containers {
            let cmd = detection.replace("$volume", &container.path);
            let stdout = match orchestrator.container_exec(container, &shell(&cmd)).await {
                Ok(stdout) => stdout,
                Err(e) => {
                    debug!(volume = %volume.name, "Detection failed in {}: {}", container.container_id, e);
                    continue;
                }
            };
            if let Some(provider) = self.providers.get(stdout.trim()) {
                debug!(volume = %volume.name, provider = %provider.name, "Provider detected");
                return provider.clone();
            }
        }
        Provider::default_provider()
    }
}

fn shell(cmd: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), cmd.to_string()]
}

/// Run a hook command in the first container mounting `volume` that
/// accepts it. The command and its output are logged under `key`.
pub async fn run_cmd(
    orchestrator: &dyn Orchestrator,
    volume: &Volume,
    cmd: &str,
    key: &str,
    logs: &mut BTreeMap<String, String>,
) -> Result<()> {
    let containers = orchestrator.get_containers_mounting_volume(volume).await?;

    let mut last_cmd = cmd.to_string();
    let mut last_output = String::new();
    for container in &containers {
        let substituted = cmd.replace("$volume", &container.path);
        match orchestrator.container_exec(container, &shell(&substituted)).await {
            Ok(stdout) => {
                logs.insert(key.to_string(), format!("$ {}\n{}", substituted, stdout));
                return Ok(());
            }
            Err(e) => {
                last_output = e.to_string();
                last_cmd = substituted;
            }
        }
    }

    logs.insert(key.to_string(), format!("$ {}\n{}", last_cmd, last_output));
    Err(BivacError::CommandFailed {
        cmd: last_cmd,
        volume: volume.name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::volume::MountedVolume;
    use crate::orchestrators::MockOrchestrator;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn mounted(volume: &Volume, id: &str, path: &str) -> MountedVolume {
        MountedVolume {
            pod_id: None,
            container_id: id.to_string(),
            host_id: "node-1".to_string(),
            volume: volume.clone(),
            path: path.to_string(),
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[providers.PostgreSQL]
detect_cmd = "[ -d $volume/base ]"
pre_cmd = "pg_dumpall > $volume/backups/all.sql"
backup_dir = "backups"

[providers.Redis]
detect_cmd = "[ -f $volume/dump.rdb ]"
"#
        )
        .unwrap();

        let providers = Providers::load(file.path()).unwrap();
        assert_eq!(providers.names(), ["PostgreSQL", "Redis"]);
        let pg = providers.get("PostgreSQL").unwrap();
        assert_eq!(pg.name, "PostgreSQL");
        assert_eq!(pg.backup_dir, "backups");
        assert!(providers.get("Redis").unwrap().pre_cmd.is_empty());
    }

    #[test]
    fn test_missing_file_uses_builtin() {
        let providers = Providers::load(Path::new("/nonexistent/providers.toml")).unwrap();
        assert!(providers.get("PostgreSQL").is_some());
        assert!(providers.get("MySQL").is_some());
    }

    #[test]
    fn test_invalid_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[providers.Broken\n").unwrap();
        assert!(Providers::load(file.path()).is_err());
    }

    #[test]
    fn test_detection_command() {
        let providers = Providers::from_toml(
            r#"
[providers.B]
detect_cmd = "test -f b"
[providers.A]
detect_cmd = "test -f a"
"#,
        )
        .unwrap();
        assert_eq!(
            providers.detection_command(),
            "(test -f a && echo 'A') || (test -f b && echo 'B') || true"
        );
    }

    #[tokio::test]
    async fn test_detects_postgresql() {
        let providers = Providers::from_toml(DEFAULT_PROVIDERS).unwrap();
        let volume = Volume::new("db-id", "db");
        let mounts = vec![mounted(&volume, "c1", "/var/lib/postgresql/data")];

        let mut orch = MockOrchestrator::new();
        orch.expect_get_containers_mounting_volume()
            .returning(move |_| Ok(mounts.clone()));
        orch.expect_container_exec()
            .withf(|_, argv| {
                argv[0] == "sh"
                    && argv[2].contains("[ -d /var/lib/postgresql/data/base ]")
                    && !argv[2].contains("$volume")
            })
            .returning(|_, _| Ok("PostgreSQL\n".to_string()));

        let provider = providers.get_provider(&orch, &volume).await;
        assert_eq!(provider.name, "PostgreSQL");
        assert_eq!(provider.backup_dir, "backups");

        let mut logs = BTreeMap::new();
        run_cmd(&orch, &volume, &provider.pre_cmd, PRE_CMD_KEY, &mut logs)
            .await
            .unwrap();
        assert!(logs[PRE_CMD_KEY].starts_with("$ mkdir -p /var/lib/postgresql/data/backups && pg_dumpall"));
    }

    #[tokio::test]
    async fn test_unmounted_volume_uses_default() {
        let providers = Providers::from_toml(DEFAULT_PROVIDERS).unwrap();
        let volume = Volume::new("id", "data");

        let mut orch = MockOrchestrator::new();
        orch.expect_get_containers_mounting_volume()
            .returning(|_| Ok(vec![]));
        orch.expect_container_exec().never();

        let provider = providers.get_provider(&orch, &volume).await;
        assert_eq!(provider, Provider::default_provider());
    }

    #[tokio::test]
    async fn test_unknown_answer_uses_default() {
        let providers = Providers::from_toml(DEFAULT_PROVIDERS).unwrap();
        let volume = Volume::new("id", "data");
        let mounts = vec![mounted(&volume, "c1", "/data"), mounted(&volume, "c2", "/srv")];

        let mut orch = MockOrchestrator::new();
        orch.expect_get_containers_mounting_volume()
            .returning(move |_| Ok(mounts.clone()));
        orch.expect_container_exec()
            .times(2)
            .returning(|m, _| {
                if m.container_id == "c1" {
                    Err(BivacError::Orchestrator("container gone".to_string()))
                } else {
                    Ok("\n".to_string())
                }
            });

        let provider = providers.get_provider(&orch, &volume).await;
        assert_eq!(provider.name, DEFAULT_PROVIDER_NAME);
    }

    #[tokio::test]
    async fn test_run_cmd_first_success_wins() {
        let volume = Volume::new("id", "data");
        let mounts = vec![mounted(&volume, "c1", "/a"), mounted(&volume, "c2", "/b")];

        let mut orch = MockOrchestrator::new();
        orch.expect_get_containers_mounting_volume()
            .returning(move |_| Ok(mounts.clone()));
        orch.expect_container_exec()
            .times(2)
            .returning(|m, _| match m.container_id.as_str() {
                "c1" => Err(BivacError::Orchestrator("exit code 127".to_string())),
                _ => Ok("done".to_string()),
            });

        let mut logs = BTreeMap::new();
        run_cmd(&orch, &volume, "sync $volume", POST_CMD_KEY, &mut logs)
            .await
            .unwrap();
        assert_eq!(logs[POST_CMD_KEY], "$ sync /b\ndone");
    }

    #[tokio::test]
    async fn test_run_cmd_fails_everywhere() {
        let volume = Volume::new("id", "data");
        let mounts = vec![mounted(&volume, "c1", "/a")];

        let mut orch = MockOrchestrator::new();
        orch.expect_get_containers_mounting_volume()
            .returning(move |_| Ok(mounts.clone()));
        orch.expect_container_exec()
            .returning(|_, _| Err(BivacError::Orchestrator("exit code 1".to_string())));

        let mut logs = BTreeMap::new();
        let err = run_cmd(&orch, &volume, "false", PRE_CMD_KEY, &mut logs)
            .await
            .unwrap_err();
        assert!(matches!(err, BivacError::CommandFailed { .. }));
        assert!(logs[PRE_CMD_KEY].starts_with("$ false"));
    }
}
