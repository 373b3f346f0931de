//! NATS connection configuration.

use engine_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::transport::{ConnectOptions, Credentials};

const DEFAULT_SCHEME: &str = "nats://";

/// Connection configuration of one table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NatsConfiguration {
    /// Single server URL; takes precedence over `servers`
    #[serde(default)]
    pub url: String,
    /// Server list, used when `url` is empty
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
    /// Reconnect attempts of the client library
    #[serde(default = "default_max_reconnect")]
    pub max_reconnect: u32,
    /// Wait between client library reconnect attempts, in milliseconds
    #[serde(default = "default_reconnect_wait_ms")]
    pub reconnect_wait_ms: u64,
    #[serde(default)]
    pub secure: bool,
}

fn default_max_reconnect() -> u32 {
    5
}

fn default_reconnect_wait_ms() -> u64 {
    2000
}

impl Default for NatsConfiguration {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            servers: Vec::new(),
            username: String::new(),
            password: String::new(),
            token: String::new(),
            max_reconnect: default_max_reconnect(),
            reconnect_wait_ms: default_reconnect_wait_ms(),
            secure: false,
        }
    }
}

impl NatsConfiguration {
    /// Address description for log lines: the URL, or the joined server list.
    pub fn connection_info_for_log(&self) -> String {
        if self.url.is_empty() {
            self.servers.join(", ")
        } else {
            self.url.clone()
        }
    }

    /// Normalizes addresses and credentials for [`crate::Transport::connect`].
    pub fn connect_options(&self) -> Result<ConnectOptions> {
        let addresses: Vec<&str> = if self.url.is_empty() {
            self.servers.iter().map(String::as_str).collect()
        } else {
            vec![self.url.as_str()]
        };

        let servers = addresses
            .into_iter()
            .filter(|address| !address.is_empty())
            .map(normalize_server)
            .collect::<Result<Vec<_>>>()?;

        if servers.is_empty() {
            return Err(Error::bad_arguments("no NATS server address configured"));
        }

        let user_password = (!self.username.is_empty() && !self.password.is_empty())
            .then(|| (self.username.clone(), self.password.clone()));
        let token = (!self.token.is_empty()).then(|| self.token.clone());

        Ok(ConnectOptions {
            servers,
            credentials: Credentials {
                user_password,
                token,
            },
            secure: self.secure,
            max_reconnect: self.max_reconnect,
            reconnect_wait: Duration::from_millis(self.reconnect_wait_ms),
        })
    }
}

/// `host:port` becomes `nats://host:port`; explicit schemes are kept.
fn normalize_server(address: &str) -> Result<String> {
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("{}{}", DEFAULT_SCHEME, address)
    };

    let url = Url::parse(&candidate)
        .map_err(|e| Error::bad_arguments(format!("invalid NATS address '{}': {}", address, e)))?;

    let host = url
        .host_str()
        .ok_or_else(|| Error::bad_arguments(format!("NATS address '{}' has no host", address)))?;

    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}
