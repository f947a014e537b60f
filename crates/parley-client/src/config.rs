use std::time::Duration;

use crate::error::ClientError;

/// Tunables for a [`Session`](crate::session::Session).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP origin of the server, e.g. `http://localhost:3210`.
    pub base_url: String,
    /// Presence keep-alive while the session is foregrounded.
    pub heartbeat_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// At most one `start_typing` per partner per window.
    pub typing_throttle: Duration,
    /// How often dirty partners are refreshed in the background.
    pub refresh_debounce: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3210".into(),
            heartbeat_interval: Duration::from_secs(20),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            typing_throttle: Duration::from_millis(300),
            refresh_debounce: Duration::from_secs(2),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// WebSocket endpoint derived from the HTTP origin.
    pub fn gateway_url(&self) -> Result<String, ClientError> {
        let base = self.base_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            return Err(ClientError::Protocol(format!(
                "base url must be http(s): {}",
                self.base_url
            )));
        };
        Ok(format!("{}/gateway", ws))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_url_follows_scheme() {
        assert_eq!(
            ClientConfig::new("https://chat.example/").gateway_url().unwrap(),
            "wss://chat.example/gateway"
        );
        assert_eq!(
            ClientConfig::new("http://127.0.0.1:3210").gateway_url().unwrap(),
            "ws://127.0.0.1:3210/gateway"
        );
        assert!(ClientConfig::new("ftp://nope").gateway_url().is_err());
    }
}
