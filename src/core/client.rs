/// Client of the manager API, used by the `backup`, `restore`, `volumes`,
/// `info` and `restic` subcommands

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::core::manager::ManagerInfo;
use crate::core::volume::Volume;
use crate::error::{BivacError, Result};

pub const DEFAULT_REMOTE_ADDRESS: &str = "http://127.0.0.1:8182";

/// Manual runs wait for the agent, which can take a while
const REQUEST_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Deserialize)]
struct Typed<T> {
    #[serde(rename = "type")]
    kind: String,
    data: Option<T>,
}

pub struct BivacClient {
    client: Client,
    remote_address: String,
    psk: String,
}

impl BivacClient {
    /// Connect to the manager at `remote_address` and check it answers
    pub async fn new(remote_address: &str, psk: &str) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let c = Self {
            client,
            remote_address: remote_address.trim_end_matches('/').to_string(),
            psk: psk.to_string(),
        };

        let pong: Typed<Value> = c.request(Method::GET, "/ping", None).await?.1;
        if pong.kind != "pong" {
            return Err(BivacError::UnexpectedResponse(pong.kind));
        }
        Ok(c)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, T)> {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.remote_address, endpoint))
            .bearer_auth(&self.psk);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(BivacError::Api {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok((status, serde_json::from_str(&text)?))
    }

    pub async fn get_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.request(Method::GET, "/volumes", None).await?.1)
    }

    /// Returns false when another run already held the volume
    pub async fn backup_volume(&self, volume: &str, force: bool) -> Result<bool> {
        let endpoint = format!("/backup/{}?force={}", volume, force);
        let (status, _): (_, Value) = self.request(Method::POST, &endpoint, None).await?;
        Ok(status == StatusCode::OK)
    }

    pub async fn restore_volume(&self, volume: &str, force: bool, snapshot: &str) -> Result<bool> {
        let endpoint = format!("/restore/{}?force={}&snapshot={}", volume, force, snapshot);
        let (status, _): (_, Value) = self.request(Method::POST, &endpoint, None).await?;
        Ok(status == StatusCode::OK)
    }

    pub async fn run_raw_command(&self, volume: &str, cmd: &[String]) -> Result<String> {
        let endpoint = format!("/restic/{}", volume);
        let (_, resp): (_, Typed<String>) = self
            .request(Method::POST, &endpoint, Some(json!({ "cmd": cmd })))
            .await?;
        Ok(resp.data.unwrap_or_default())
    }

    pub async fn get_informations(&self) -> Result<ManagerInfo> {
        let (_, resp): (_, Typed<ManagerInfo>) = self.request(Method::GET, "/info", None).await?;
        resp.data
            .ok_or_else(|| BivacError::UnexpectedResponse("empty info".to_string()))
    }
}
