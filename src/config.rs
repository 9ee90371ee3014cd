use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub download_dir: PathBuf,
    pub log_level: String,
    pub timeout_secs: u64,
    pub cancel_grace_ms: u64,
    pub max_redirects: u32,
    pub follow_redirects: bool,
    pub user_agent: String,
    pub event_buffer: usize,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            // Default settings
            .set_default("server_port", 7878)?
            .set_default("download_dir", "./downloads")?
            .set_default("log_level", "info")?
            .set_default("timeout_secs", 30)?
            .set_default("cancel_grace_ms", 500)?
            .set_default("max_redirects", 5)?
            .set_default("follow_redirects", true)?
            .set_default(
                "user_agent",
                concat!("releasedl/", env!("CARGO_PKG_VERSION")),
            )?
            .set_default("event_buffer", 256)?
            // Config file (optional)
            .add_source(File::with_name("config").required(false))
            // Environment variables (e.g. RELEASEDL_SERVER_PORT=8080)
            .add_source(Environment::with_prefix("RELEASEDL"));

        builder.build()?.try_deserialize()
    }

    /// Inactivity window for a single transport session.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
