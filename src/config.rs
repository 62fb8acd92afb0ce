//! Client configuration

use std::time::Duration;

use crate::token::TokenConfig;

/// Default API host
pub const DEFAULT_API_HOST: &str = "https://api.statehost.dev";

/// Configuration for the Statehost client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API host, e.g. `https://api.statehost.dev`
    pub api_host: String,
    /// Organization scope for realtime connections, if the credential is not
    /// already org-scoped
    pub org_id: Option<String>,
    /// How the client obtains its bearer credential
    pub token: TokenConfig,
    /// Timeout for individual HTTP requests
    pub request_timeout: Duration,
    /// Realtime transport knobs
    pub realtime: RealtimeConfig,
}

impl ClientConfig {
    pub fn new(token: TokenConfig) -> Self {
        Self {
            api_host: DEFAULT_API_HOST.to_string(),
            org_id: None,
            token,
            request_timeout: Duration::from_secs(30),
            realtime: RealtimeConfig::default(),
        }
    }
}

/// Realtime transport configuration
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Keep-alive ping interval while connected
    pub ping_interval: Duration,
    /// Delay between reconnection attempts. Zero mirrors the service's
    /// immediate-retry default.
    pub reconnect_delay: Duration,
    /// Maximum consecutive failed connect attempts before giving up
    /// (0 = unlimited)
    pub max_reconnect_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            reconnect_delay: Duration::ZERO,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new(TokenConfig::Static("tok".into()));
        assert_eq!(config.api_host, DEFAULT_API_HOST);
        assert_eq!(config.realtime.ping_interval, Duration::from_secs(30));
        assert_eq!(config.realtime.reconnect_delay, Duration::ZERO);
        assert_eq!(config.realtime.max_reconnect_attempts, 0); // Unlimited
    }
}
