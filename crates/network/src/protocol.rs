//! Wire protocol for PeerTalk
//!
//! Messages are MessagePack maps with short field names. The `q` field
//! carries a free-form command token which is classified against a fixed
//! vocabulary on receipt.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::PROTOCOL_VERSION;
use crate::error::{NetworkError, Result};
use crate::peers::{Endpoint, PeerDescriptor};

/// Resolved command of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ping,
    Pong,
    /// Boot request asking for a sample of trusted peers.
    Query,
    Assert,
    PeerList,
    Unknown,
}

/// Tokens searched for in `q`, with the command each resolves to.
const VOCABULARY: [(&str, Command); 5] = [
    ("ping", Command::Ping),
    ("pong", Command::Pong),
    ("query", Command::Query),
    ("assert", Command::Assert),
    ("peer", Command::PeerList),
];

impl Command {
    /// Classify a command token.
    ///
    /// The token is searched case-insensitively for the leftmost occurrence of
    /// any vocabulary term, so `"peers"` and `"#PING"` both resolve.
    pub fn classify(token: &str) -> Self {
        let token = token.to_ascii_lowercase();
        VOCABULARY
            .iter()
            .filter_map(|(term, command)| token.find(term).map(|pos| (pos, *command)))
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, command)| command)
            .unwrap_or(Command::Unknown)
    }

    /// Name of the event this command is dispatched under.
    pub fn event_name(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Query => "query",
            Command::Assert => "assert",
            Command::PeerList => "peer",
            Command::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// A single datagram's worth of protocol data.
///
/// Only a malformed encoding fails to decode. Numeric fields of the wrong
/// type are coerced or dropped, and peer entries that are not maps are kept
/// as empty descriptors for the registry to reject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "v", default, deserialize_with = "lenient::version")]
    pub version: u32,
    #[serde(rename = "q", default)]
    pub query: String,
    #[serde(
        rename = "t",
        default,
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<u64>,
    #[serde(
        default,
        alias = "p",
        deserialize_with = "lenient::peers",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub peers: Vec<PeerDescriptor>,
    #[serde(
        default,
        deserialize_with = "lenient::count",
        skip_serializing_if = "Option::is_none"
    )]
    pub count: Option<i64>,
    /// Free-form text, used by the operator console.
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Message {
    pub fn new<S: Into<String>>(query: S) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn ping(timestamp: u64) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Self::new("ping")
        }
    }

    pub fn pong(timestamp: u64) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Self::new("pong")
        }
    }

    /// Boot request for up to `count` trusted peers.
    pub fn query(count: i64) -> Self {
        Self {
            count: Some(count),
            ..Self::new("query")
        }
    }

    pub fn peer_list(version: u32, peers: &[Endpoint]) -> Self {
        Self {
            version,
            peers: peers.iter().map(PeerDescriptor::from).collect(),
            ..Self::new("peers")
        }
    }

    pub fn text<S: Into<String>, T: Into<String>>(query: S, text: T) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(query)
        }
    }

    pub fn command(&self) -> Command {
        Command::classify(&self.query)
    }
}

mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use crate::config::PROTOCOL_VERSION;
    use crate::peers::{coerce_integer, PeerDescriptor};

    type Result<T, E> = std::result::Result<T, E>;

    pub fn version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(coerce_integer(&value)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(PROTOCOL_VERSION))
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(coerce_integer(&value).and_then(|t| u64::try_from(t).ok()))
    }

    pub fn count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(coerce_integer(&value))
    }

    pub fn peers<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<PeerDescriptor>, D::Error> {
        let entries = match Value::deserialize(deserializer)? {
            Value::Array(entries) => entries,
            _ => return Ok(Vec::new()),
        };

        Ok(entries
            .into_iter()
            .map(|entry| match entry {
                Value::Object(mut fields) => PeerDescriptor {
                    address: fields.remove("address").unwrap_or(Value::Null),
                    port: fields.remove("port").unwrap_or(Value::Null),
                },
                _ => PeerDescriptor::default(),
            })
            .collect())
    }
}

/// Serialize a message, refusing anything larger than `max_size` bytes.
pub fn encode(message: &Message, max_size: usize) -> Result<Vec<u8>> {
    let bytes = rmp_serde::to_vec_named(message)?;
    if bytes.len() > max_size {
        return Err(NetworkError::Encode(format!(
            "message is {} bytes, limit is {}",
            bytes.len(),
            max_size
        )));
    }
    Ok(bytes)
}

/// Deserialize a datagram and classify its command.
pub fn decode(bytes: &[u8]) -> Result<(Command, Message)> {
    let message: Message = rmp_serde::from_slice(bytes)?;
    Ok((message.command(), message))
}

/// Current wall-clock time in milliseconds, as carried in `t`.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
