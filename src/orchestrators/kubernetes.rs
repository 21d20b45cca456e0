/// Kubernetes orchestrator
///
/// Volumes are PersistentVolumeClaims. Agents run as one-shot pods mounting
/// the claim, pinned to the claim's node when the claim is ReadWriteOnce.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Node, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, Volume as PodVolume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::Orchestrator;
use crate::core::filters::Filters;
use crate::core::volume::{MountedVolume, Volume, DEFAULT_MOUNTPOINT, UNBOUND_HOST};
use crate::error::{BivacError, Result};

/// PVC annotation opting a claim in or out of backups
pub const BACKUP_ANNOTATION: &str = "bivac.backup";

pub const AGENT_NAME_PREFIX: &str = "bivac-agent-";
pub const AGENT_CONTAINER_NAME: &str = "bivac-agent";

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const START_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct KubernetesConfig {
    /// Namespace to watch, the client's default namespace when empty
    pub namespace: String,
    pub all_namespaces: bool,
    pub kubeconfig: Option<PathBuf>,
    pub agent_service_account: String,
    /// Only back up claims annotated `bivac.backup=true`
    pub whitelist_annotation: bool,
}

/// True when running inside a cluster
pub fn detect() -> bool {
    std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
}

pub struct KubernetesOrchestrator {
    client: Client,
    config: KubernetesConfig,
}

impl KubernetesOrchestrator {
    pub async fn new(config: &KubernetesConfig) -> Result<Self> {
        let client = match &config.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| BivacError::Orchestrator(format!("failed to read kubeconfig: {}", e)))?;
                let kube_config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| BivacError::Orchestrator(format!("invalid kubeconfig: {}", e)))?;
                Client::try_from(kube_config)?
            }
            None => Client::try_default().await?,
        };
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn claims(&self) -> Api<PersistentVolumeClaim> {
        if self.config.all_namespaces {
            Api::all(self.client.clone())
        } else if self.config.namespace.is_empty() {
            Api::default_namespaced(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.config.namespace)
        }
    }

    async fn wait_for_pod(&self, pods: &Api<Pod>, name: &str) -> Result<bool> {
        let started = tokio::time::Instant::now();
        loop {
            let pod = pods.get(name).await?;
            let phase = pod
                .status
                .and_then(|s| s.phase)
                .unwrap_or_default();
            match phase.as_str() {
                "Succeeded" => return Ok(true),
                "Failed" => return Ok(false),
                "Running" => {}
                _ if started.elapsed() > START_TIMEOUT => {
                    return Err(BivacError::Orchestrator(format!(
                        "agent {} did not start within {}s",
                        name,
                        START_TIMEOUT.as_secs()
                    )))
                }
                _ => {}
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Whether the `bivac.backup` annotation keeps the claim
pub(crate) fn annotation_allows(
    annotations: Option<&BTreeMap<String, String>>,
    whitelist_annotation: bool,
) -> bool {
    let value = annotations
        .and_then(|a| a.get(BACKUP_ANNOTATION))
        .map(|v| v.to_lowercase());
    match (value, whitelist_annotation) {
        (Some(v), true) => v == "true",
        (None, true) => false,
        (Some(v), false) => v != "false",
        (None, false) => true,
    }
}

/// Containers of `pods` mounting the claim `volume`
pub(crate) fn mounts_from_pods(pods: &[Pod], volume: &Volume) -> Vec<MountedVolume> {
    let mut mounted = Vec::new();
    for pod in pods {
        let Some(spec) = &pod.spec else { continue };
        let claim_volumes: Vec<&str> = spec
            .volumes
            .iter()
            .flatten()
            .filter(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .map(|c| c.claim_name == volume.name)
                    .unwrap_or(false)
            })
            .map(|v| v.name.as_str())
            .collect();
        if claim_volumes.is_empty() {
            continue;
        }

        for container in &spec.containers {
            for mount in container.volume_mounts.iter().flatten() {
                if !claim_volumes.contains(&mount.name.as_str()) {
                    continue;
                }
                let already = mounted
                    .iter()
                    .any(|m: &MountedVolume| m.pod_id == pod.metadata.name && m.container_id == container.name);
                if already {
                    continue;
                }
                mounted.push(MountedVolume {
                    pod_id: pod.metadata.name.clone(),
                    container_id: container.name.clone(),
                    host_id: spec.node_name.clone().unwrap_or_default(),
                    volume: volume.clone(),
                    path: mount.mount_path.clone(),
                });
            }
        }
    }
    mounted
}

/// Node the agent must run on: the volume's node for ReadWriteOnce claims,
/// none otherwise
pub(crate) fn agent_node(access_modes: &[String], volume: &Volume) -> Option<String> {
    let rwo = access_modes.iter().any(|m| m == "ReadWriteOnce");
    let bound = !volume.host_bind.is_empty() && volume.host_bind != UNBOUND_HOST;
    if rwo && bound {
        Some(volume.host_bind.clone())
    } else {
        None
    }
}

/// Pod definition of an agent
pub(crate) fn build_agent_pod(
    image: &str,
    argv: &[String],
    env: &[(String, String)],
    volume: &Volume,
    access_modes: &[String],
    service_account: &str,
) -> Pod {
    let mut labels = BTreeMap::new();
    if let Ok(host) = std::env::var("HOSTNAME") {
        labels.insert("generatedFromPod".to_string(), host);
    }

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(AGENT_NAME_PREFIX.to_string()),
            namespace: Some(volume.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: agent_node(access_modes, volume),
            restart_policy: Some("Never".to_string()),
            service_account_name: (!service_account.is_empty()).then(|| service_account.to_string()),
            volumes: Some(vec![PodVolume {
                name: volume.name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: volume.name.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: AGENT_CONTAINER_NAME.to_string(),
                image: Some(image.to_string()),
                args: Some(argv.to_vec()),
                env: Some(
                    env.iter()
                        .map(|(k, v)| EnvVar {
                            name: k.clone(),
                            value: Some(v.clone()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                volume_mounts: Some(vec![VolumeMount {
                    name: volume.name.clone(),
                    mount_path: volume.mountpoint.clone(),
                    read_only: Some(volume.read_only),
                    ..Default::default()
                }]),
                image_pull_policy: Some("Always".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl Orchestrator for KubernetesOrchestrator {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn path(&self, volume: &Volume) -> String {
        volume.namespace.clone()
    }

    async fn get_volumes(&self, filters: &Filters) -> Result<Vec<Volume>> {
        let claims = self.claims().list(&ListParams::default()).await?;

        let mut volumes = Vec::new();
        for pvc in claims.items {
            let meta = &pvc.metadata;
            let name = meta.name.clone().unwrap_or_default();
            if !annotation_allows(meta.annotations.as_ref(), self.config.whitelist_annotation) {
                debug!(volume = %name, "Skipping claim because of its {} annotation", BACKUP_ANNOTATION);
                continue;
            }
            let labels = meta.labels.clone().unwrap_or_default();
            if !filters.is_accepted(&name, &labels) {
                continue;
            }

            let mut v = Volume::new(meta.uid.clone().unwrap_or_else(|| name.clone()), name);
            v.namespace = meta.namespace.clone().unwrap_or_default();
            v.labels = labels;
            v.host_bind = UNBOUND_HOST.to_string();
            v.hostname = UNBOUND_HOST.to_string();

            match self.get_containers_mounting_volume(&v).await {
                Ok(mounts) => {
                    if let Some(first) = mounts.first() {
                        v.host_bind = first.host_id.clone();
                        v.hostname = first.host_id.clone();
                        v.mountpoint = first.path.clone();
                    }
                }
                Err(e) => warn!(volume = %v.name, "Failed to list pods mounting claim: {}", e),
            }
            if v.mountpoint.is_empty() {
                v.mountpoint = DEFAULT_MOUNTPOINT.to_string();
            }
            volumes.push(v);
        }
        Ok(volumes)
    }

    async fn get_containers_mounting_volume(&self, volume: &Volume) -> Result<Vec<MountedVolume>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &volume.namespace);
        let running = pods
            .list(&ListParams::default().fields("status.phase=Running"))
            .await?;
        Ok(mounts_from_pods(&running.items, volume))
    }

    async fn container_exec(&self, mounted: &MountedVolume, argv: &[String]) -> Result<String> {
        let pod_name = mounted
            .pod_id
            .as_deref()
            .ok_or_else(|| BivacError::Orchestrator("mounted volume has no pod".to_string()))?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &mounted.volume.namespace);

        let params = AttachParams::default()
            .container(mounted.container_id.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut process = pods.exec(pod_name, argv.to_vec(), &params).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let out = process.stdout();
        let err = process.stderr();
        let read_out = async {
            if let Some(mut s) = out {
                s.read_to_string(&mut stdout).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_err = async {
            if let Some(mut s) = err {
                s.read_to_string(&mut stderr).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (r1, r2) = tokio::join!(read_out, read_err);
        r1?;
        r2?;

        let status = match process.take_status() {
            Some(status) => status.await,
            None => None,
        };
        process
            .join()
            .await
            .map_err(|e| BivacError::Orchestrator(format!("exec failed: {}", e)))?;

        match status.and_then(|s| s.status) {
            Some(s) if s != "Success" => Err(BivacError::Orchestrator(format!(
                "command failed in {}/{}: {}",
                pod_name,
                mounted.container_id,
                stderr.trim()
            ))),
            _ => Ok(stdout),
        }
    }

    async fn deploy_agent(
        &self,
        image: &str,
        argv: &[String],
        env: &[(String, String)],
        volume: &Volume,
    ) -> Result<(bool, String)> {
        // access modes are read now, the claim may have been rebound since discovery
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &volume.namespace);
        let pvc = claims.get(&volume.name).await?;
        let access_modes = pvc
            .spec
            .and_then(|s| s.access_modes)
            .unwrap_or_default();

        let pod = build_agent_pod(
            image,
            argv,
            env,
            volume,
            &access_modes,
            &self.config.agent_service_account,
        );

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &volume.namespace);
        let created = pods.create(&PostParams::default(), &pod).await?;
        let name = created.metadata.name.unwrap_or_default();
        debug!(volume = %volume.name, agent = %name, "Agent pod created");

        let result = match self.wait_for_pod(&pods, &name).await {
            Ok(success) => pods
                .logs(&name, &LogParams::default())
                .await
                .map(|logs| (success, logs))
                .map_err(BivacError::from),
            Err(e) => Err(e),
        };

        if let Err(e) = pods.delete(&name, &DeleteParams::default()).await {
            warn!(volume = %volume.name, "Failed to delete agent pod {}: {}", name, e);
        }

        result
    }

    async fn is_node_available(&self, host: &str) -> Result<bool> {
        if host.is_empty() || host == UNBOUND_HOST {
            return Ok(true);
        }
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get(host).await?;
        let ready = node
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True");
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_volume() -> Volume {
        let mut v = Volume::new("uid-1", "data");
        v.namespace = "apps".to_string();
        v.host_bind = "node-1".to_string();
        v.mountpoint = "/var/lib/data".to_string();
        v
    }

    fn pod(name: &str, node: &str, claim: &str, mount_path: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                volumes: Some(vec![PodVolume {
                    name: "storage".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.to_string(),
                        read_only: None,
                    }),
                    ..Default::default()
                }]),
                containers: vec![
                    Container {
                        name: "app".to_string(),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "storage".to_string(),
                            mount_path: mount_path.to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    },
                    Container {
                        name: "sidecar".to_string(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_rwo_claim_is_pinned() {
        let v = claim_volume();
        let pod = build_agent_pod(
            "camptocamp/bivac:2.5",
            &["agent".to_string()],
            &[],
            &v,
            &["ReadWriteOnce".to_string()],
            "bivac",
        );
        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("node-1"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.service_account_name.as_deref(), Some("bivac"));
        assert_eq!(pod.metadata.generate_name.as_deref(), Some("bivac-agent-"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("apps"));

        let container = &spec.containers[0];
        assert_eq!(container.name, "bivac-agent");
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        let mounts = container.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, "/var/lib/data");
        let claim = spec.volumes.unwrap()[0].persistent_volume_claim.clone().unwrap();
        assert_eq!(claim.claim_name, "data");
    }

    #[test]
    fn test_rwx_claim_is_not_pinned() {
        let v = claim_volume();
        let modes = ["ReadWriteMany".to_string(), "ReadOnlyMany".to_string()];
        let pod = build_agent_pod("img", &[], &[], &v, &modes, "");
        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_name, None);
        assert_eq!(spec.service_account_name, None);
    }

    #[test]
    fn test_unbound_claim_is_not_pinned() {
        let mut v = claim_volume();
        v.host_bind = UNBOUND_HOST.to_string();
        assert_eq!(agent_node(&["ReadWriteOnce".to_string()], &v), None);
    }

    #[test]
    fn test_annotation_filter() {
        let mut annotations = BTreeMap::new();
        assert!(annotation_allows(None, false));
        assert!(!annotation_allows(None, true));

        annotations.insert(BACKUP_ANNOTATION.to_string(), "False".to_string());
        assert!(!annotation_allows(Some(&annotations), false));
        assert!(!annotation_allows(Some(&annotations), true));

        annotations.insert(BACKUP_ANNOTATION.to_string(), "true".to_string());
        assert!(annotation_allows(Some(&annotations), false));
        assert!(annotation_allows(Some(&annotations), true));
    }

    #[test]
    fn test_mounts_from_pods() {
        let v = claim_volume();
        let pods = vec![
            pod("web-0", "node-2", "data", "/srv/data"),
            pod("other-0", "node-3", "logs", "/var/log"),
        ];
        let mounted = mounts_from_pods(&pods, &v);
        assert_eq!(mounted.len(), 1);
        assert_eq!(mounted[0].pod_id.as_deref(), Some("web-0"));
        assert_eq!(mounted[0].container_id, "app");
        assert_eq!(mounted[0].host_id, "node-2");
        assert_eq!(mounted[0].path, "/srv/data");
    }
}
