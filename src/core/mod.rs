pub mod agent;
pub mod client;
pub mod engine;
pub mod envelope;
pub mod filters;
pub mod manager;
pub mod metrics;
pub mod providers;
pub mod volume;

pub use envelope::Envelope;
pub use filters::Filters;
pub use manager::Manager;
pub use volume::{BackupStatus, Volume};
