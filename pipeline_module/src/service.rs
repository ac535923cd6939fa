mod config;
mod server;
mod state;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::{
    ServiceConfig, DEFAULT_BATCH_DELAY, DEFAULT_INBOUND_BODY_MAX_BYTES, DEFAULT_MAX_BATCH_BYTES,
};
pub use server::run_server;
pub use state::{AppState, ProductionOrchestrator};
