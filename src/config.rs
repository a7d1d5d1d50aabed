//! Runtime configuration for the client channel and the relay server.
//!
//! Both structs follow the same pattern: sensible `Default`s, builder-style
//! `with_*` setters, and `from_env()` reading optional overrides.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration for a client `SocketChannel`
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket endpoint of the relay
    pub url: String,
    /// Reconnect automatically after the connection drops
    pub reconnect: bool,
    /// Delay before the first reconnect attempt
    pub reconnect_delay: Duration,
    /// Upper bound for the exponential backoff
    pub reconnect_delay_max: Duration,
    /// Give up after this many consecutive failed attempts (None = never)
    pub max_reconnect_attempts: Option<u32>,
    /// How long to wait for an acknowledgement (None = forever)
    pub ack_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3010/ws".to_string(),
            reconnect: true,
            reconnect_delay: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(10),
            max_reconnect_attempts: None,
            ack_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SYNC_URL") {
            config.url = url;
        }
        if let Some(reconnect) = env_parse::<bool>("SYNC_RECONNECT") {
            config.reconnect = reconnect;
        }
        if let Some(ms) = env_parse::<u64>("SYNC_ACK_TIMEOUT_MS") {
            config.ack_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(attempts) = env_parse::<u32>("SYNC_MAX_RECONNECT_ATTEMPTS") {
            config = config.with_max_reconnect_attempts(attempts);
        }

        config
    }

    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.reconnect_delay_max = max;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based), doubling up to the max
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.reconnect_delay_max)
    }
}

/// Configuration for the relay server binary
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3010,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_parse("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT").unwrap_or(defaults.port),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
