pub mod app;
pub mod auth;
pub mod config;
pub mod docker;
pub mod labels;
pub mod proxy;
pub mod signal;
pub mod store;
pub mod tls;

pub use config::Config;

/// Service name reported by the health endpoint and log lines.
pub const SERVICE_NAME: &str = "harborgate";

/// Crate version reported by the health endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
