//! Peer endpoints and the trust-tiered peer registry.
//!
//! Peers are tracked in two independent LRU sets: `pending` holds endpoints
//! learned from gossip that have never talked to us, `trusted` holds
//! endpoints that completed at least one protocol exchange. An endpoint lives
//! in at most one of the two sets.

use lru::LruCache;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Instant;
use tracing::debug;

use crate::config::PeerTalkConfig;
use crate::error::{NetworkError, Result};

/// A reachable peer, identified by its literal `(address, port)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(address: S, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Validate a loosely-typed descriptor and fill in the default port.
    ///
    /// The address must be a non-empty string. The port is accepted from an
    /// integer or a numeric string in `1..=65535`; anything else falls back to
    /// `default_port`.
    pub fn normalize(descriptor: &PeerDescriptor, default_port: u16) -> Result<Self> {
        let address = match &descriptor.address {
            Value::String(address) if !address.is_empty() => address.clone(),
            Value::String(_) => {
                return Err(NetworkError::Normalization("empty address".into()));
            }
            Value::Null => {
                return Err(NetworkError::Normalization("missing address".into()));
            }
            other => {
                return Err(NetworkError::Normalization(format!(
                    "address must be a string, got {}",
                    other
                )));
            }
        };

        let port = coerce_port(&descriptor.port).unwrap_or(default_port);
        Ok(Self { address, port })
    }
}

/// Read an integer out of a loosely-typed value, truncating fractions and
/// parsing numeric strings.
pub(crate) fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| i64::try_from(u).unwrap_or(i64::MAX)))
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f.trunc() as i64),
        _ => None,
    }
}

fn coerce_port(value: &Value) -> Option<u16> {
    coerce_integer(value)
        .and_then(|raw| u16::try_from(raw).ok())
        .filter(|port| *port != 0)
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    /// IPv4-mapped addresses are reported as plain IPv4. A non-zero IPv6
    /// scope id is kept as a `%<id>` suffix so link-local peers stay reachable.
    fn from(addr: SocketAddr) -> Self {
        let ip = addr.ip().to_canonical();
        let address = match addr {
            SocketAddr::V6(v6) if ip.is_ipv6() && v6.scope_id() != 0 => {
                format!("{}%{}", ip, v6.scope_id())
            }
            _ => ip.to_string(),
        };
        Self {
            address,
            port: addr.port(),
        }
    }
}

/// Peer record as it appears on the wire, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub address: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub port: Value,
}

impl PeerDescriptor {
    pub fn new(address: impl Into<Value>, port: impl Into<Value>) -> Self {
        Self {
            address: address.into(),
            port: port.into(),
        }
    }

    /// Descriptor carrying only an address.
    pub fn address(address: impl Into<Value>) -> Self {
        Self {
            address: address.into(),
            port: Value::Null,
        }
    }
}

impl From<&Endpoint> for PeerDescriptor {
    fn from(endpoint: &Endpoint) -> Self {
        Self::new(endpoint.address.clone(), endpoint.port)
    }
}

impl From<Endpoint> for PeerDescriptor {
    fn from(endpoint: Endpoint) -> Self {
        Self::from(&endpoint)
    }
}

impl From<SocketAddr> for PeerDescriptor {
    fn from(addr: SocketAddr) -> Self {
        Self::from(Endpoint::from(addr))
    }
}

/// Bounded pending/trusted peer sets with least-recently-used eviction.
///
/// Values record the last time an entry was touched.
pub struct PeerRegistry {
    pending: LruCache<Endpoint, Instant>,
    trusted: LruCache<Endpoint, Instant>,
    default_port: u16,
    sample_limit: usize,
    rng: StdRng,
}

impl PeerRegistry {
    pub fn new(config: &PeerTalkConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Registry with a deterministic sampling sequence.
    pub fn with_seed(config: &PeerTalkConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &PeerTalkConfig, rng: StdRng) -> Self {
        let capacity = NonZeroUsize::new(config.peer_limit).unwrap_or(NonZeroUsize::MIN);
        Self {
            pending: LruCache::new(capacity),
            trusted: LruCache::new(capacity),
            default_port: config.default_port,
            sample_limit: config.sample_limit.max(1),
            rng,
        }
    }

    pub fn normalize(&self, descriptor: &PeerDescriptor) -> Result<Endpoint> {
        Endpoint::normalize(descriptor, self.default_port)
    }

    /// Record a peer we have only heard about.
    ///
    /// Peers that are already trusted stay in the trusted set untouched.
    pub fn add_pending(&mut self, peer: impl Into<PeerDescriptor>) -> Result<Endpoint> {
        let endpoint = self.normalize(&peer.into())?;
        if self.trusted.contains(&endpoint) {
            return Ok(endpoint);
        }
        if let Some((evicted, _)) = self.pending.push(endpoint.clone(), Instant::now()) {
            if evicted != endpoint {
                debug!("Evicted pending peer {}", evicted);
            }
        }
        Ok(endpoint)
    }

    /// Move a peer into the trusted set, refreshing its recency.
    pub fn promote(&mut self, peer: impl Into<PeerDescriptor>) -> Result<Endpoint> {
        let endpoint = self.normalize(&peer.into())?;
        if self.pending.pop(&endpoint).is_some() {
            debug!("Promoted pending peer {}", endpoint);
        }
        if let Some((evicted, _)) = self.trusted.push(endpoint.clone(), Instant::now()) {
            if evicted != endpoint {
                debug!("Evicted trusted peer {}", evicted);
            }
        }
        Ok(endpoint)
    }

    /// Drop a peer from both sets.
    pub fn remove(&mut self, peer: impl Into<PeerDescriptor>) -> Result<Endpoint> {
        let endpoint = self.normalize(&peer.into())?;
        let was_trusted = self.trusted.pop(&endpoint).is_some();
        let was_pending = self.pending.pop(&endpoint).is_some();
        if was_trusted || was_pending {
            debug!("Removed peer {}", endpoint);
        }
        Ok(endpoint)
    }

    /// Whether the endpoint is trusted. Pending peers are not considered known.
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.trusted.contains(endpoint)
    }

    pub fn is_pending(&self, endpoint: &Endpoint) -> bool {
        self.pending.contains(endpoint)
    }

    /// Up to `n` distinct trusted endpoints chosen uniformly at random.
    ///
    /// `n` is clamped to `[1, sample_limit]`. Sampling does not refresh recency.
    pub fn sample(&mut self, n: usize) -> Vec<Endpoint> {
        let n = n.clamp(1, self.sample_limit);
        let keys: Vec<&Endpoint> = self.trusted.iter().map(|(endpoint, _)| endpoint).collect();
        keys.choose_multiple(&mut self.rng, n)
            .map(|endpoint| (*endpoint).clone())
            .collect()
    }

    /// Trusted endpoints, most recently touched first.
    pub fn trusted(&self) -> Vec<Endpoint> {
        self.trusted.iter().map(|(endpoint, _)| endpoint.clone()).collect()
    }

    /// Pending endpoints, most recently touched first.
    pub fn pending(&self) -> Vec<Endpoint> {
        self.pending.iter().map(|(endpoint, _)| endpoint.clone()).collect()
    }

    pub fn trusted_len(&self) -> usize {
        self.trusted.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn capacity(&self) -> usize {
        self.trusted.cap().get()
    }

    pub fn sample_limit(&self) -> usize {
        self.sample_limit
    }
}

impl fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("pending", &self.pending.len())
            .field("trusted", &self.trusted.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
