//! Device agent for the trackline upload pipeline.
//!
//! The agent reads its configuration from `~/.config/trackline/agent.toml`,
//! opens the durable queue, and runs a positioning source through the
//! pipeline until interrupted:
//!
//! ```toml
//! [endpoint]
//! url = "https://collector.example.com"
//!
//! [auth]
//! token_file = "/run/trackline/token"
//!
//! [sync]
//! interval_secs = 60
//! max_rejections = 5   # 0 retries rejected samples forever
//! ```
//!
//! Every section is optional; see [`Config`] for the defaults.

pub mod agent;
pub mod config;
pub mod sources;

pub use agent::{AgentError, Overrides, build_pipeline, credentials, open_queue, summary_client};
pub use config::{
    AuthConfig, CaptureConfig, Config, ConfigError, ConnectivityConfig, EndpointConfig,
    LoggingConfig, StorageConfig, SyncConfig, ValidationError, default_config_path,
};
pub use sources::{CaptureResult, LineSource, SimulatedSource};
