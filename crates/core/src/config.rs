//! Client configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// DTLS credentials for the cloud session, held in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Credentials {
    /// Pre-shared key
    Psk {
        /// PSK identity hint
        identity: String,
        /// Key bytes
        key: Vec<u8>,
    },
    /// Certificate credentials
    Pki {
        /// CA certificate, DER or PEM
        ca_cert: Vec<u8>,
        /// Client certificate
        client_cert: Vec<u8>,
        /// Client private key
        private_key: Vec<u8>,
    },
}

/// Main configuration for a [`crate::Client`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Cloud endpoint, `coaps://<host>[:port]`
    pub server_uri: String,

    /// Session credentials
    pub credentials: Credentials,

    /// How long to await a server response per request (default: 10 s)
    pub response_timeout: Duration,

    /// Request queue capacity (default: 10)
    pub request_queue_max_items: usize,

    /// Bounded dequeue wait; idle transport I/O is serviced between
    /// expirations (default: 1000 ms)
    pub queue_poll_interval: Duration,

    /// Keepalive ping period; zero disables keepalive (default: 30 s)
    pub keepalive_interval: Duration,

    /// Observation registry capacity (default: 8)
    pub observation_capacity: usize,

    /// Pause between tearing down a session and reconnecting
    /// (default: 1 s)
    pub reconnect_cooldown: Duration,

    /// Worker thread stack size in bytes (default: 256 KiB)
    pub task_stack_bytes: usize,

    /// Worker thread scheduling priority, 0..=100. Applied best-effort
    /// and only with the `realtime` feature (default: None)
    pub task_priority: Option<u8>,
}

impl ClientConfig {
    /// Configuration with defaults for everything but the endpoint and
    /// credentials.
    pub fn new(server_uri: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            server_uri: server_uri.into(),
            credentials,
            response_timeout: Duration::from_secs(10),
            request_queue_max_items: 10,
            queue_poll_interval: Duration::from_millis(1000),
            keepalive_interval: Duration::from_secs(30),
            observation_capacity: 8,
            reconnect_cooldown: Duration::from_secs(1),
            task_stack_bytes: 256 * 1024,
            task_priority: None,
        }
    }

    /// Validate the server URI: `coaps` scheme and a host are required.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.server_uri).map_err(|_| Error::InvalidFormat)?;
        if url.scheme() != "coaps" || url.host_str().is_none() {
            return Err(Error::InvalidFormat);
        }
        if self.request_queue_max_items == 0 {
            return Err(Error::InvalidFormat);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn psk() -> Credentials {
        Credentials::Psk {
            identity: "device-1@project".to_string(),
            key: b"supersecret".to_vec(),
        }
    }

    #[test]
    fn accepts_coaps_uri() {
        let config = ClientConfig::new("coaps://coap.example.io", psk());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        for uri in ["coap://coap.example.io", "https://x.io", "not a uri", ""] {
            let config = ClientConfig::new(uri, psk());
            assert_eq!(config.validate().err(), Some(Error::InvalidFormat));
        }
    }

    #[test]
    fn rejects_zero_capacity_queue() {
        let mut config = ClientConfig::new("coaps://coap.example.io", psk());
        config.request_queue_max_items = 0;
        assert_eq!(config.validate().err(), Some(Error::InvalidFormat));
    }
}
