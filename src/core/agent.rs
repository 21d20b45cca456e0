/// Agent side of a backup
///
/// Runs the engine against the mounted volume and reports the envelope,
/// either on stdout or step by step to the manager's log receiver.

use reqwest::Client;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::core::engine::Engine;
use crate::core::envelope::Envelope;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAction {
    Backup {
        retention: Vec<String>,
        verify: bool,
    },
    Restore {
        snapshot: String,
    },
    Restic {
        argv: Vec<String>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    pub backup_path: String,
    pub hostname: String,
    pub force: bool,
    pub log_receiver: Option<String>,
    pub psk: String,
}

/// Posts envelopes to the manager
#[derive(Clone)]
pub struct LogReceiver {
    client: Client,
    url: String,
    psk: String,
}

impl LogReceiver {
    pub fn new(url: &str, psk: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            psk: psk.to_string(),
        })
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.psk)
            .json(envelope)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            info!("Response from API ({}): {}", status, body);
        }
        Ok(())
    }
}

async fn run_engine(mut engine: Engine, action: &AgentAction, opts: &AgentOptions) -> Envelope {
    match action {
        AgentAction::Backup { retention, verify } => {
            engine
                .backup(&opts.backup_path, &opts.hostname, opts.force, retention, *verify)
                .await
        }
        AgentAction::Restore { snapshot } => {
            engine
                .restore(&opts.backup_path, &opts.hostname, opts.force, snapshot)
                .await
        }
        AgentAction::Restic { argv } => engine.raw(argv).await,
    }
}

/// Run `action` and report its envelope. Returns the full envelope so the
/// caller can derive the exit code.
pub async fn run(engine: Engine, action: AgentAction, opts: AgentOptions) -> Result<Envelope> {
    let Some(url) = opts.log_receiver.clone().filter(|u| !u.is_empty()) else {
        let envelope = run_engine(engine, &action, &opts).await;
        println!("{}", envelope.to_json());
        return Ok(envelope);
    };

    let receiver = LogReceiver::new(&url, &opts.psk)?;
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let forwarder = {
        let receiver = receiver.clone();
        tokio::spawn(async move {
            while let Some(step) = rx.recv().await {
                if let Err(e) = receiver.send(&step).await {
                    error!("Failed to send step to {}: {}", receiver.url, e);
                }
            }
        })
    };

    let envelope = run_engine(engine.with_listener(tx), &action, &opts).await;
    // the engine, and with it the sender, is gone: the forwarder drains and stops
    if let Err(e) = forwarder.await {
        error!("Log forwarder stopped: {}", e);
    }

    if let Envelope::Error(_) = envelope {
        receiver.send(&envelope).await?;
    }
    Ok(envelope)
}
