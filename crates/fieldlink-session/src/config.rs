//! Session configuration.
//!
//! Plain structs with defaults, deserializable from TOML. Everything here
//! can also be set programmatically; the file form exists for deployments
//! that ship a station address alongside the rest of their config.

use serde::Deserialize;
use std::net::SocketAddr;

use crate::cycle::SendParameters;

/// Configuration for a [`ConnectionSession`](crate::session::ConnectionSession).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Address the setup task aims the transport at before the first peer
    /// announcement arrives.
    pub station_addr: SocketAddr,
    /// Defaults for send cycles started without explicit parameters.
    pub send: SendParameters,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            station_addr: "192.168.49.1:20884".parse().expect("valid default address"),
            send: SendParameters::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}
