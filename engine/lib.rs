pub mod cluster;
pub mod config;
pub mod handler;
pub mod instance_lock;
pub mod lifecycle;
pub mod protocol;
pub mod telemetry;
pub mod warmup;

pub use config::{Cli, ServerConfig};
pub use lifecycle::{BootstrapError, Lifecycle, LifecycleState, Serving};
