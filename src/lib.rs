/// Bivac: backup interface for volumes attached to containers
///
/// The manager discovers volumes on an orchestrator, dispatches agents
/// running restic next to them and serves the results over HTTP.

pub mod cli;
pub mod core;
pub mod error;
pub mod orchestrators;
#[cfg(feature = "server")]
pub mod server;
pub mod utils;

pub use error::{BivacError, Result};
