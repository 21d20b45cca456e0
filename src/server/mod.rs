/// HTTP API of the manager
/// Volume listing, manual triggers, raw restic commands, metrics and the
/// agents' log receiver

pub mod auth;
pub mod handlers;
pub mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::core::manager::Manager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub psk: String,
}

pub async fn run(manager: Arc<Manager>, address: &str, psk: String) -> anyhow::Result<()> {
    let app = create_router(AppState { manager, psk });

    let addr: SocketAddr = address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
