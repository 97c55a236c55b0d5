//! Protocol constants and per-instance configuration.

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Wire protocol version written into the `v` field.
pub const PROTOCOL_VERSION: u32 = 0;

/// UDP port used when none is given.
pub const DEFAULT_PORT: u16 = 4305;

/// Capacity of each peer set.
pub const DEFAULT_PEER_LIMIT: usize = 256;

/// Fixed receive buffer and encode ceiling.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Configuration for a PeerTalk socket and its registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerTalkConfig {
    pub version: u32,
    pub default_port: u16,
    pub peer_limit: usize,
    /// Ceiling on the number of endpoints returned for a single boot request.
    pub sample_limit: usize,
    pub max_datagram_size: usize,
}

impl Default for PeerTalkConfig {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            default_port: DEFAULT_PORT,
            peer_limit: DEFAULT_PEER_LIMIT,
            sample_limit: DEFAULT_PEER_LIMIT,
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

impl PeerTalkConfig {
    /// Config with a custom peer limit; the sample ceiling follows it.
    pub fn with_peer_limit(peer_limit: usize) -> Self {
        Self {
            peer_limit,
            sample_limit: peer_limit,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.peer_limit == 0 {
            return Err(NetworkError::Config("peer_limit must be at least 1".into()));
        }
        if self.sample_limit == 0 {
            return Err(NetworkError::Config("sample_limit must be at least 1".into()));
        }
        if self.max_datagram_size == 0 {
            return Err(NetworkError::Config(
                "max_datagram_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = PeerTalkConfig::default();
        assert_eq!(config.version, 0);
        assert_eq!(config.default_port, 4305);
        assert_eq!(config.peer_limit, 256);
        assert_eq!(config.max_datagram_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = PeerTalkConfig::with_peer_limit(0);
        assert!(matches!(config.validate(), Err(NetworkError::Config(_))));

        let config = PeerTalkConfig {
            max_datagram_size: 0,
            ..PeerTalkConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
