use std::time::Duration;
use tracing::info;

/// Server URL used when `VEIL_SERVER_URL` is not set.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:9001";

/// Connection tuning for [`Channel`](super::Channel).
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Realtime endpoint; the session token is appended as `?token=`.
    pub server_url: String,
    /// How long one connection attempt may take.
    pub connect_timeout: Duration,
    /// Period of `keep-alive` frames while connected.
    pub keep_alive_interval: Duration,
    /// Delay after the first failed attempt; doubles per further failure.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Consecutive failures after which a successful connect is reported as
    /// [`ChannelNotice::Restored`](super::ChannelNotice::Restored).
    pub restore_threshold: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            connect_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            restore_threshold: 3,
        }
    }
}

impl ChannelConfig {
    /// Defaults, with the server URL taken from the build-time or runtime
    /// `VEIL_SERVER_URL` (a `.env` file is honoured).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        // Priority: build-time env -> runtime env -> default
        let build_time_url = option_env!("VEIL_SERVER_URL");
        let runtime_url = std::env::var("VEIL_SERVER_URL").ok();

        let server_url = build_time_url
            .map(String::from)
            .or(runtime_url)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

        info!(url = %server_url, "Using WebSocket server URL");

        Self {
            server_url,
            ..Self::default()
        }
    }

    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = server_url.into();
        self
    }

    /// Backoff before the next attempt after `failed_attempts` consecutive
    /// failures (at least one).
    pub fn backoff_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        self.reconnect_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_reconnect_delay)
    }
}
