use serde::Deserialize;

use crate::address::ServerAddr;

/// The JSON document carried by the broker's `INFO` frame
///
/// Received once during the handshake and again whenever the broker's
/// topology changes (discovered routes, lame duck mode).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ServerInfo {
    pub server_id: String,
    #[serde(default, rename = "server_name")]
    pub server_name: String,
    pub version: String,
    #[serde(rename = "proto")]
    pub protocol_version: u32,
    pub max_payload: u64,
    #[serde(default)]
    pub client_id: Option<u64>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub tls_available: bool,
    #[serde(default, rename = "headers")]
    pub supports_headers: bool,
    #[serde(default)]
    pub connect_urls: Vec<ServerAddr>,
    #[serde(default, rename = "ldm")]
    pub lame_duck_mode: bool,
    #[serde(default, rename = "jetstream")]
    pub supports_jetstream: bool,
    #[serde(default)]
    pub nonce: Option<String>,
}
