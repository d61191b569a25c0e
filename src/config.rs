//! Configuration types for the adapter layer

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default idle timeout applied to stream-transport sessions
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Configuration for one negotiated media session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerConfig {
    /// ICE servers (STUN/TURN) used for candidate gathering
    pub ice_servers: Vec<IceServerConfig>,

    /// Lower bound of the local UDP port range (unbounded if None)
    pub min_port: Option<u16>,

    /// Upper bound of the local UDP port range (unbounded if None)
    pub max_port: Option<u16>,
}

impl PeerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_port, self.max_port) {
            if min > max {
                return Err(Error::InvalidConfig(format!(
                    "port range {}..{} is inverted",
                    min, max
                )));
            }
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::InvalidConfig(
                    "ICE server entry has no URLs".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One ICE server entry (STUN or TURN)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (`stun:` or `turn:`)
    pub urls: Vec<String>,

    /// Username for TURN authentication (empty for STUN)
    pub username: String,

    /// Credential for TURN authentication (empty for STUN)
    pub credential: String,
}

/// Configuration for one data channel, fixed at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel label
    pub label: String,

    /// Deliver messages in order
    pub ordered: bool,

    /// Retransmit limit; None means unlimited retransmits
    pub max_retransmits: Option<u16>,

    /// Retransmit time window in milliseconds; None means unlimited
    pub max_packet_life_time: Option<u16>,

    /// Application protocol tag carried in the channel parameters
    pub protocol: String,

    /// Pre-negotiated SCTP stream id; None for in-band announcement
    pub negotiated: Option<u16>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            ordered: true,
            max_retransmits: None,
            max_packet_life_time: None,
            protocol: String::new(),
            negotiated: None,
        }
    }
}

impl ChannelConfig {
    /// Create a reliable, ordered channel configuration with the given label
    pub fn reliable(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    /// True when no retransmit or lifetime limit applies
    pub fn is_reliable(&self) -> bool {
        self.max_retransmits.is_none() && self.max_packet_life_time.is_none()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.label.is_empty() {
            return Err(Error::InvalidConfig("channel label is empty".to_string()));
        }
        if self.max_retransmits.is_some() && self.max_packet_life_time.is_some() {
            return Err(Error::InvalidConfig(
                "retransmit count and lifetime limits are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for one outbound stream-transport connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Server host name (also used for certificate validation)
    pub server_name: String,

    /// Server UDP port
    pub port: u16,

    /// Idle timeout in milliseconds; 0 disables the timeout
    pub idle_timeout_ms: u64,

    /// PEM file with trust anchors for server certificate validation
    pub trust_anchor_file: Option<PathBuf>,

    /// Disable certificate validation entirely.
    ///
    /// Development/test escape hatch only; the connection logs a warning
    /// when this is set and it must never be enabled in production
    /// configuration.
    pub allow_insecure: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            port: 0,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            trust_anchor_file: None,
            allow_insecure: false,
        }
    }
}

impl ConnectConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_name.is_empty() {
            return Err(Error::InvalidConfig("server name is empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig("server port is zero".to_string()));
        }
        Ok(())
    }
}

/// Configuration for one stream-transport listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Local bind address, `ip:port`
    pub bind_addr: String,

    /// Idle timeout applied to accepted sessions, in milliseconds
    pub idle_timeout_ms: u64,

    /// PEM file with the server certificate chain
    pub cert_file: PathBuf,

    /// PEM file with the server private key
    pub key_file: PathBuf,

    /// Password for a password-protected private key; None for plain keys
    pub key_password: Option<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_addr: String::new(),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            cert_file: PathBuf::new(),
            key_file: PathBuf::new(),
            key_password: None,
        }
    }
}

impl ListenConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "bind address '{}' is not an ip:port pair",
                self.bind_addr
            )));
        }
        if self.cert_file.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("certificate file is empty".to_string()));
        }
        if self.key_file.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("key file is empty".to_string()));
        }
        Ok(())
    }
}
