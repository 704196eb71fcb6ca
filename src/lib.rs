// Resilient client - Library root

pub mod auth;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod http_client;
pub mod retry_policy;
pub mod upload;

pub use client::ApiClient;
pub use config::ClientConfig;
pub use error::{ApiError, ErrorKind};
