//! PeerTalk Network Core
//!
//! A minimal peer discovery protocol over UDP. Nodes exchange small
//! MessagePack datagrams to learn about each other, keep a bounded set of
//! pending and trusted peers, and gossip peer lists to grow the network
//! without a central directory.
//!
//! ## Modules
//! - `config`: Protocol constants and per-socket configuration
//! - `peers`: Endpoint normalization and the pending/trusted peer registry
//! - `protocol`: Wire messages, command classification and the codec
//! - `transport`: UDP socket, receive loop and typed event dispatch
//! - `discovery`: Ping/pong, boot requests and peer-list gossip
//! - `metrics`: Datagram and failure counters

pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod peers;
pub mod protocol;
pub mod transport;

// ------------------------------------------------------------
// Re-exports
// ------------------------------------------------------------

pub use config::{
    PeerTalkConfig, DEFAULT_PEER_LIMIT, DEFAULT_PORT, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION,
};
pub use discovery::{Notification, PeerTalkClient};
pub use error::{NetworkError, Result};
pub use metrics::{NetworkMetrics, NetworkMetricsSnapshot};
pub use peers::{Endpoint, PeerDescriptor, PeerRegistry};
pub use protocol::{decode, encode, now_millis, Command, Message};
pub use transport::{PeerTalkSocket, SocketEvent};
