use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the agent service.
    pub base_url: String,
    /// Application name sent on every upstream call.
    pub app_name: String,
    /// Overall deadline for the blocking calls and for opening a stream.
    pub request_timeout_secs: u64,
    /// Maximum gap between successive streamed events before the turn is
    /// treated as failed.
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database location; None means the default under the home directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig {
                base_url: "http://localhost:8000".to_string(),
                app_name: "viva".to_string(),
                request_timeout_secs: 60,
                idle_timeout_secs: 120,
            },
            storage: StorageConfig { db_path: None },
        }
    }
}
