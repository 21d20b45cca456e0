/// Error types shared by the manager, the agent and the orchestrator drivers

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BivacError {
    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    #[error("'{0}' is not a valid orchestrator")]
    UnknownOrchestrator(String),

    #[error("no orchestrator detected")]
    NoOrchestrator,

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("failed to run command \"{cmd}\" in containers mounting volume {volume}")]
    CommandFailed { cmd: String, volume: String },

    #[error("failed to load providers: {0}")]
    Providers(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("volume {0} is busy")]
    VolumeBusy(String),

    #[error("agent returned an error: {0}")]
    Agent(String),

    #[error("received wrong status code from the Bivac instance: [{status}] {body}")]
    Api { status: u16, body: String },

    #[error("unexpected response from the Bivac instance: {0}")]
    UnexpectedResponse(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BivacError>;
