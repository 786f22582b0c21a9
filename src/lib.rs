/// Eventhook - ordered event distribution engine
///
/// Fans out instance change events to HTTP subscribers with best-effort
/// per-subscriber ordering, coordinated through a shared store.

pub mod config;
pub mod context;
pub mod db;
pub mod distribution;
pub mod error;
pub mod metrics;
pub mod server;
pub mod store;

pub use config::EngineConfig;
pub use context::AppContext;
pub use error::{HookError, HookResult};
