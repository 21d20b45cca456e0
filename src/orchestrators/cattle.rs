/// Cattle (Rancher 1.x) orchestrator
///
/// Talks to the Rancher v2-beta API. Logs and exec output are streamed over
/// websockets opened with the token the API hands out.
///
/// Cattle reports no terminal state for one-shot containers. An agent is
/// considered successful once it is `stopped` with a start count of 1 and
/// is still stopped 5 seconds later. A start count above 1 means the
/// on-failure restart policy kicked in, so the first run failed.
///
/// Agents are pinned to the host of the volume's storage pool, looked up
/// again at dispatch so a moved volume is not backed up from its old host.

use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt;
use regex::Regex;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::Orchestrator;
use crate::core::filters::Filters;
use crate::core::volume::{MountedVolume, Volume, DEFAULT_MOUNTPOINT};
use crate::error::{BivacError, Result};
use crate::utils::helpers::agent_name;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const START_TIMEOUT: Duration = Duration::from_secs(60);
const STOPPED_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct CattleConfig {
    pub url: String,
    pub access_key: String,
    pub secret_key: String,
}

/// True when the Rancher metadata service resolves
pub async fn detect() -> bool {
    tokio::net::lookup_host("rancher-metadata:80").await.is_ok()
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMount {
    #[serde(default)]
    path: String,
    #[serde(default)]
    instance_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiVolume {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mounts: Vec<ApiMount>,
    #[serde(default)]
    links: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoragePool {
    #[serde(default)]
    host_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Host {
    #[serde(default)]
    hostname: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiContainer {
    id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    start_count: i64,
    #[serde(default)]
    links: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct HostAccess {
    url: String,
    token: String,
}

/// What the watch loop should do after one observation of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchStep {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
}

pub(crate) struct AgentWatch {
    created: Instant,
    stopped_since: Option<Instant>,
}

impl AgentWatch {
    pub(crate) fn new(created: Instant) -> Self {
        Self {
            created,
            stopped_since: None,
        }
    }

    pub(crate) fn observe(&mut self, state: &str, start_count: i64, now: Instant) -> WatchStep {
        match state {
            "stopped" if start_count > 1 => WatchStep::Failed,
            "stopped" => match self.stopped_since {
                None => {
                    self.stopped_since = Some(now);
                    WatchStep::Pending
                }
                Some(since) if now.duration_since(since) >= STOPPED_GRACE => WatchStep::Succeeded,
                Some(_) => WatchStep::Pending,
            },
            "error" => WatchStep::Failed,
            "starting" if now.duration_since(self.created) > START_TIMEOUT => WatchStep::TimedOut,
            _ => {
                self.stopped_since = None;
                WatchStep::Pending
            }
        }
    }
}

/// Payload lines of a Rancher log stream, `<stream> <timestamp> <payload>`
pub(crate) fn parse_log_stream(raw: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?m)[0-9]{2,} [ZT\-:.0-9]+ (.*)$").expect("valid log line regex")
    });
    re.captures_iter(raw)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_exec_chunk(chunk: &str) -> String {
    match base64::engine::general_purpose::STANDARD.decode(chunk.trim()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => chunk.to_string(),
    }
}

/// First host of the first storage pool backing a volume
fn pool_host(pools: &Collection<StoragePool>) -> Option<String> {
    pools.data.first().and_then(|p| p.host_ids.first()).cloned()
}

/// Container definition of an agent, pinned to `host_id`
pub(crate) fn agent_container(
    image: &str,
    argv: &[String],
    env: &[(String, String)],
    volume: &Volume,
    host_id: &str,
) -> Value {
    let environment: BTreeMap<&str, &str> =
        env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    json!({
        "name": agent_name(),
        "requestedHostId": host_id,
        "imageUuid": format!("docker:{}", image),
        "command": argv,
        "environment": environment,
        "restartPolicy": {
            "name": "on-failure",
            "maximumRetryCount": 1,
        },
        "labels": {
            "io.rancher.container.pull_image": "always",
        },
        "dataVolumes": [format!("{}:{}", volume.name, volume.mountpoint)],
    })
}

pub struct CattleOrchestrator {
    client: Client,
    config: CattleConfig,
}

impl CattleOrchestrator {
    pub fn new(config: &CattleConfig) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    async fn call<T: DeserializeOwned>(&self, method: Method, url: &str, body: Option<Value>) -> Result<T> {
        let mut req = self
            .client
            .request(method, url)
            .basic_auth(&self.config.access_key, Some(&self.config.secret_key));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?.error_for_status()?;
        Ok(resp.json::<T>().await?)
    }

    async fn container(&self, id: &str) -> Result<ApiContainer> {
        self.call(Method::GET, &self.endpoint(&format!("containers/{}", id)), None)
            .await
    }

    /// Read a websocket handed out by the API until the server closes it
    async fn read_socket(&self, access: HostAccess) -> Result<Vec<String>> {
        let mut url = url::Url::parse(&access.url)
            .map_err(|e| BivacError::Orchestrator(format!("invalid websocket url: {}", e)))?;
        url.query_pairs_mut().append_pair("token", &access.token);

        let mut request = url.as_str().into_client_request()?;
        if let Ok(origin) = HeaderValue::from_str(&self.config.url) {
            request.headers_mut().insert("Origin", origin);
        }

        let (mut socket, _) = tokio_tungstenite::connect_async(request).await?;
        let mut chunks = Vec::new();
        while let Some(msg) = socket.next().await {
            match msg? {
                Message::Text(text) => chunks.push(text),
                Message::Binary(bytes) => chunks.push(String::from_utf8_lossy(&bytes).into_owned()),
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(chunks)
    }

    async fn watch_agent(&self, id: &str) -> Result<bool> {
        let mut watch = AgentWatch::new(Instant::now());
        loop {
            let container = self.container(id).await?;
            match watch.observe(&container.state, container.start_count, Instant::now()) {
                WatchStep::Succeeded => return Ok(true),
                WatchStep::Failed => return Ok(false),
                WatchStep::TimedOut => {
                    return Err(BivacError::Orchestrator(format!(
                        "agent {} did not start within {}s",
                        id,
                        START_TIMEOUT.as_secs()
                    )))
                }
                WatchStep::Pending => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    }

    async fn storage_host(&self, api: &ApiVolume) -> Result<Option<String>> {
        let Some(pools_link) = api.links.get("storagePools") else {
            return Ok(None);
        };
        let pools: Collection<StoragePool> = self.call(Method::GET, pools_link, None).await?;
        Ok(pool_host(&pools))
    }

    /// Host currently holding the volume. Falls back to the host seen at
    /// discovery when the API cannot tell.
    async fn dispatch_host(&self, volume: &Volume) -> String {
        let current = match self
            .call::<ApiVolume>(Method::GET, &self.endpoint(&format!("volumes/{}", volume.id)), None)
            .await
        {
            Ok(api) => self.storage_host(&api).await,
            Err(e) => Err(e),
        };
        match current {
            Ok(Some(host)) => {
                if host != volume.host_bind {
                    debug!(volume = %volume.name, from = %volume.host_bind, to = %host, "Volume moved");
                }
                host
            }
            Ok(None) => volume.host_bind.clone(),
            Err(e) => {
                debug!(volume = %volume.name, "Failed to get storage pools: {}", e);
                volume.host_bind.clone()
            }
        }
    }

    async fn agent_logs(&self, id: &str) -> Result<String> {
        let container = self.container(id).await?;
        let self_link = container
            .links
            .get("self")
            .cloned()
            .unwrap_or_else(|| self.endpoint(&format!("containers/{}", id)));
        let access: HostAccess = self
            .call(
                Method::POST,
                &format!("{}/?action=logs", self_link),
                Some(json!({"follow": false, "lines": 9999, "since": "", "timestamps": true})),
            )
            .await?;
        let raw = self.read_socket(access).await?.concat();
        Ok(parse_log_stream(&raw))
    }

    async fn remove_container(&self, id: &str) {
        let url = self.endpoint(&format!("containers/{}", id));
        if let Err(e) = self.call::<Value>(Method::DELETE, &url, None).await {
            warn!("Failed to remove agent container {}: {}", id, e);
        }
    }
}

#[async_trait]
impl Orchestrator for CattleOrchestrator {
    fn name(&self) -> &'static str {
        "cattle"
    }

    fn path(&self, volume: &Volume) -> String {
        volume.hostname.clone()
    }

    async fn get_volumes(&self, filters: &Filters) -> Result<Vec<Volume>> {
        let list: Collection<ApiVolume> = self
            .call(Method::GET, &self.endpoint("volumes?limit=-2&all=true"), None)
            .await?;

        let mut volumes = Vec::new();
        for api in list.data {
            if !filters.is_accepted(&api.name, &BTreeMap::new()) {
                continue;
            }
            let host_id = match self.storage_host(&api).await {
                Ok(Some(host_id)) => host_id,
                Ok(None) => continue,
                Err(e) => {
                    debug!(volume = %api.name, "Failed to get storage pools: {}", e);
                    continue;
                }
            };
            let hostname = match self
                .call::<Host>(Method::GET, &self.endpoint(&format!("hosts/{}", host_id)), None)
                .await
            {
                Ok(host) if !host.hostname.is_empty() => host.hostname,
                _ => host_id.clone(),
            };

            let mut v = Volume::new(api.id.clone(), api.name.clone());
            v.mountpoint = api
                .mounts
                .first()
                .map(|m| m.path.clone())
                .unwrap_or_else(|| DEFAULT_MOUNTPOINT.to_string());
            v.host_bind = host_id;
            v.namespace = hostname.clone();
            v.hostname = hostname;
            volumes.push(v);
        }
        Ok(volumes)
    }

    async fn get_containers_mounting_volume(&self, volume: &Volume) -> Result<Vec<MountedVolume>> {
        let api: ApiVolume = self
            .call(Method::GET, &self.endpoint(&format!("volumes/{}", volume.id)), None)
            .await?;

        let mut mounted = Vec::new();
        for mount in api.mounts {
            let Ok(instance) = self.container(&mount.instance_id).await else {
                continue;
            };
            if instance.state != "running" {
                continue;
            }
            mounted.push(MountedVolume {
                pod_id: None,
                container_id: mount.instance_id,
                host_id: volume.host_bind.clone(),
                volume: volume.clone(),
                path: mount.path,
            });
        }
        Ok(mounted)
    }

    async fn container_exec(&self, mounted: &MountedVolume, argv: &[String]) -> Result<String> {
        let access: HostAccess = self
            .call(
                Method::POST,
                &self.endpoint(&format!("containers/{}?action=execute", mounted.container_id)),
                Some(json!({
                    "attachStdin": false,
                    "attachStdout": true,
                    "command": argv,
                    "tty": false,
                })),
            )
            .await?;
        let chunks = self.read_socket(access).await?;
        Ok(chunks.iter().map(|c| decode_exec_chunk(c)).collect())
    }

    async fn deploy_agent(
        &self,
        image: &str,
        argv: &[String],
        env: &[(String, String)],
        volume: &Volume,
    ) -> Result<(bool, String)> {
        let host_id = self.dispatch_host(volume).await;
        let created: ApiContainer = self
            .call(
                Method::POST,
                &self.endpoint("containers"),
                Some(agent_container(image, argv, env, volume, &host_id)),
            )
            .await?;
        debug!(volume = %volume.name, agent = %created.id, "Agent container created");

        let result = match self.watch_agent(&created.id).await {
            Ok(success) => self.agent_logs(&created.id).await.map(|logs| (success, logs)),
            Err(e) => Err(e),
        };

        self.remove_container(&created.id).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_success_needs_grace_period() {
        let t0 = Instant::now();
        let mut watch = AgentWatch::new(t0);
        assert_eq!(watch.observe("starting", 0, t0), WatchStep::Pending);
        assert_eq!(watch.observe("running", 1, t0 + Duration::from_secs(2)), WatchStep::Pending);
        assert_eq!(watch.observe("stopped", 1, t0 + Duration::from_secs(10)), WatchStep::Pending);
        assert_eq!(watch.observe("stopped", 1, t0 + Duration::from_secs(12)), WatchStep::Pending);
        assert_eq!(watch.observe("stopped", 1, t0 + Duration::from_secs(15)), WatchStep::Succeeded);
    }

    #[test]
    fn test_watch_restarted_agent_failed() {
        let t0 = Instant::now();
        let mut watch = AgentWatch::new(t0);
        assert_eq!(watch.observe("stopped", 1, t0 + Duration::from_secs(3)), WatchStep::Pending);
        // restarted by the on-failure policy
        assert_eq!(watch.observe("running", 2, t0 + Duration::from_secs(4)), WatchStep::Pending);
        assert_eq!(watch.observe("stopped", 2, t0 + Duration::from_secs(9)), WatchStep::Failed);
    }

    #[test]
    fn test_watch_error_and_timeout() {
        let t0 = Instant::now();
        let mut watch = AgentWatch::new(t0);
        assert_eq!(watch.observe("error", 0, t0), WatchStep::Failed);

        let mut watch = AgentWatch::new(t0);
        assert_eq!(watch.observe("starting", 0, t0 + Duration::from_secs(59)), WatchStep::Pending);
        assert_eq!(watch.observe("starting", 0, t0 + Duration::from_secs(61)), WatchStep::TimedOut);
    }

    #[test]
    fn test_parse_log_stream() {
        let raw = "01 2024-03-01T10:00:00.123456789Z backup: done\n\
                   02 2024-03-01T10:00:01Z {\"type\":\"success\",\"content\":{}}\r\n\
                   garbage\n";
        assert_eq!(
            parse_log_stream(raw),
            "backup: done\n{\"type\":\"success\",\"content\":{}}"
        );
    }

    #[test]
    fn test_decode_exec_chunk() {
        assert_eq!(decode_exec_chunk("UG9zdGdyZVNRTAo="), "PostgreSQL\n");
        assert_eq!(decode_exec_chunk("not base64!"), "not base64!");
    }

    #[test]
    fn test_agent_container() {
        let mut v = Volume::new("1v42", "data");
        v.host_bind = "1h3".to_string();
        v.mountpoint = "/srv".to_string();
        let env = vec![("RESTIC_PASSWORD".to_string(), "secret".to_string())];
        let c = agent_container("camptocamp/bivac:2.5", &["agent".to_string()], &env, &v, "1h7");

        assert_eq!(c["requestedHostId"], "1h7");
        assert_eq!(c["imageUuid"], "docker:camptocamp/bivac:2.5");
        assert_eq!(c["restartPolicy"]["maximumRetryCount"], 1);
        assert_eq!(c["dataVolumes"][0], "data:/srv");
        assert_eq!(c["environment"]["RESTIC_PASSWORD"], "secret");
        assert!(c["name"].as_str().unwrap().starts_with("bivac-agent-"));
    }

    #[test]
    fn test_pool_host() {
        let pools: Collection<StoragePool> =
            serde_json::from_str(r#"{"data":[{"hostIds":["1h7","1h8"]},{"hostIds":["1h9"]}]}"#).unwrap();
        assert_eq!(pool_host(&pools).as_deref(), Some("1h7"));

        let pools: Collection<StoragePool> = serde_json::from_str(r#"{"data":[{"hostIds":[]}]}"#).unwrap();
        assert_eq!(pool_host(&pools), None);

        let pools: Collection<StoragePool> = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert_eq!(pool_host(&pools), None);
    }
}
