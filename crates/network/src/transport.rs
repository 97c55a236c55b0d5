//! UDP transport for PeerTalk
//!
//! `PeerTalkSocket` owns one UDP endpoint. A background task reads
//! datagrams, decodes them and publishes typed [`SocketEvent`]s on an
//! unbounded channel that the owner takes once via [`PeerTalkSocket::take_events`].
//! Sends are fire-and-forget: one datagram per call, no acknowledgement.

use parking_lot::{Mutex, RwLock};
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PeerTalkConfig;
use crate::error::{NetworkError, Result};
use crate::metrics::NetworkMetrics;
use crate::peers::Endpoint;
use crate::protocol::{self, Command, Message};

/// Events published by the receive loop.
#[derive(Debug)]
pub enum SocketEvent {
    /// A datagram decoded into a message.
    Message {
        command: Command,
        message: Message,
        from: Endpoint,
    },
    /// A datagram that could not be decoded. The socket stays open.
    DecodeError { from: Endpoint, error: NetworkError },
    /// The socket failed and has been closed.
    Fatal(NetworkError),
    /// The socket was closed. Emitted exactly once.
    Closed,
}

/// State shared between the socket handle and its receive loop.
struct Shared {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<SocketEvent>,
    metrics: NetworkMetrics,
}

impl Shared {
    fn publish(&self, event: SocketEvent) {
        if self.events.send(event).is_err() {
            debug!("Socket event dropped, receiver is gone");
        }
    }

    /// Release the UDP socket. Returns `false` if it was already closed.
    fn shutdown(&self) -> bool {
        self.socket.write().take();
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.publish(SocketEvent::Closed);
        true
    }
}

/// A single UDP endpoint speaking the PeerTalk wire protocol.
pub struct PeerTalkSocket {
    config: PeerTalkConfig,
    shared: Arc<Shared>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SocketEvent>>>,
}

impl PeerTalkSocket {
    pub fn new(config: PeerTalkConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            config,
            shared: Arc::new(Shared {
                socket: RwLock::new(None),
                closed: AtomicBool::new(false),
                events: events_tx,
                metrics: NetworkMetrics::new(),
            }),
            receive_task: Mutex::new(None),
            events: Mutex::new(Some(events_rx)),
        }
    }

    pub fn config(&self) -> &PeerTalkConfig {
        &self.config
    }

    /// Take the event stream. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SocketEvent>> {
        self.events.lock().take()
    }

    /// Bind the UDP endpoint and start the receive loop.
    ///
    /// Defaults to the configured port on the unspecified IPv6 address, which
    /// accepts IPv4 traffic as well on dual-stack hosts. Binding twice fails
    /// with [`NetworkError::AlreadyBound`]; a failed bind closes the socket.
    pub async fn listen(&self, port: Option<u16>, address: Option<IpAddr>) -> Result<SocketAddr> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        if let Some(socket) = self.shared.socket.read().as_ref() {
            return Err(NetworkError::AlreadyBound(socket.local_addr()?));
        }

        let bind_addr = SocketAddr::new(
            address.unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            port.unwrap_or(self.config.default_port),
        );

        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                error!("Failed to bind UDP socket on {}: {}", bind_addr, err);
                self.shared.publish(SocketEvent::Fatal(NetworkError::Transport(
                    io::Error::new(err.kind(), err.to_string()),
                )));
                self.shared.shutdown();
                return Err(err.into());
            }
        };
        let local_addr = socket.local_addr()?;

        {
            let mut slot = self.shared.socket.write();
            if let Some(existing) = slot.as_ref() {
                return Err(NetworkError::AlreadyBound(existing.local_addr()?));
            }
            *slot = Some(socket.clone());
        }

        let handle = tokio::spawn(receive_loop(
            socket,
            self.shared.clone(),
            self.config.max_datagram_size,
        ));
        *self.receive_task.lock() = Some(handle);

        info!("PeerTalk socket listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Release the endpoint and stop dispatching. Returns `false` if the
    /// socket was already closed.
    pub fn close(&self) -> bool {
        let closed_now = self.shared.shutdown();
        if let Some(handle) = self.receive_task.lock().take() {
            handle.abort();
        }
        if closed_now {
            info!("PeerTalk socket closed");
        }
        closed_now
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.current_socket()?.local_addr()?)
    }

    pub fn metrics(&self) -> &NetworkMetrics {
        &self.shared.metrics
    }

    /// Encode `message` and send it as one datagram.
    pub async fn send(&self, message: &Message, to: &Endpoint) -> Result<usize> {
        let bytes = match protocol::encode(message, self.config.max_datagram_size) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.shared.metrics.record_encode_failure();
                warn!("Failed to encode {} for {}: {}", message.command(), to, err);
                return Err(err);
            }
        };
        self.send_raw(&bytes, to).await
    }

    /// Send pre-encoded bytes as one datagram.
    pub async fn send_raw(&self, bytes: &[u8], to: &Endpoint) -> Result<usize> {
        let socket = self.current_socket()?;
        let target = resolve(socket.local_addr()?, to).await?;

        match socket.send_to(bytes, target).await {
            Ok(sent) => {
                self.shared.metrics.record_datagram_sent(sent);
                debug!("Sent {} bytes to {}", sent, to);
                Ok(sent)
            }
            Err(err) => {
                self.shared.metrics.record_send_failure();
                warn!("Failed to send datagram to {}: {}", to, err);
                Err(err.into())
            }
        }
    }

    fn current_socket(&self) -> Result<Arc<UdpSocket>> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        self.shared
            .socket
            .read()
            .clone()
            .ok_or(NetworkError::NotListening)
    }
}

impl Drop for PeerTalkSocket {
    fn drop(&mut self) {
        if let Some(handle) = self.receive_task.lock().take() {
            handle.abort();
        }
    }
}

/// Pick a destination address reachable from a socket bound to `local`.
async fn resolve(local: SocketAddr, to: &Endpoint) -> Result<SocketAddr> {
    if let Some(scoped) = scoped_ipv6(to) {
        return Ok(scoped);
    }

    let candidates: Vec<SocketAddr> = lookup_host((to.address.as_str(), to.port))
        .await?
        .collect();

    let target = if local.is_ipv4() {
        candidates.into_iter().find(SocketAddr::is_ipv4)
    } else {
        candidates.into_iter().next().map(|addr| match addr {
            SocketAddr::V4(v4) => SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port()),
            v6 => v6,
        })
    };

    target.ok_or_else(|| {
        NetworkError::Transport(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable address for {} from {}", to, local),
        ))
    })
}

/// Parse a `fe80::1%3` style literal with a numeric scope id.
fn scoped_ipv6(to: &Endpoint) -> Option<SocketAddr> {
    let (ip, scope) = to.address.split_once('%')?;
    let ip: Ipv6Addr = ip.parse().ok()?;
    let scope: u32 = scope.parse().ok()?;
    Some(SocketAddr::V6(SocketAddrV6::new(ip, to.port, 0, scope)))
}

async fn receive_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            // ICMP port-unreachable for an earlier send surfaces as a reset on some platforms.
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(err) => {
                error!("UDP socket failure: {}", err);
                shared.publish(SocketEvent::Fatal(NetworkError::Transport(err)));
                shared.shutdown();
                break;
            }
        };

        shared.metrics.record_datagram_received(len);
        let from = Endpoint::from(addr);

        match protocol::decode(&buf[..len]) {
            Ok((command, message)) => {
                debug!("Received {} from {}: {:?}", command, from, message);
                shared.publish(SocketEvent::Message {
                    command,
                    message,
                    from,
                });
            }
            Err(error) => {
                shared.metrics.record_decode_failure();
                warn!("Dropping undecodable datagram from {}: {}", from, error);
                shared.publish(SocketEvent::DecodeError { from, error });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const LOOPBACK: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    async fn bound_socket() -> (PeerTalkSocket, Endpoint) {
        let socket = PeerTalkSocket::new(PeerTalkConfig::default());
        let addr = socket.listen(Some(0), Some(LOOPBACK)).await.unwrap();
        (socket, Endpoint::from(addr))
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SocketEvent>) -> SocketEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for socket event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_send_and_dispatch() {
        let (alice, alice_ep) = bound_socket().await;
        let (bob, bob_ep) = bound_socket().await;
        let mut events = bob.take_events().unwrap();

        alice.send(&Message::ping(1000), &bob_ep).await.unwrap();

        match next_event(&mut events).await {
            SocketEvent::Message {
                command,
                message,
                from,
            } => {
                assert_eq!(command, Command::Ping);
                assert_eq!(message.timestamp, Some(1000));
                assert_eq!(from, alice_ep);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(alice.metrics().snapshot().datagrams_sent, 1);
        assert_eq!(bob.metrics().snapshot().datagrams_received, 1);
    }

    #[tokio::test]
    async fn test_garbage_surfaces_decode_error() {
        let (alice, _) = bound_socket().await;
        let (bob, bob_ep) = bound_socket().await;
        let mut events = bob.take_events().unwrap();

        alice.send_raw(&[0xc1, 0xc1, 0xc1], &bob_ep).await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            SocketEvent::DecodeError { .. }
        ));

        // Still usable afterwards.
        alice.send(&Message::new("garbage-xyz"), &bob_ep).await.unwrap();
        match next_event(&mut events).await {
            SocketEvent::Message { command, .. } => assert_eq!(command, Command::Unknown),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!bob.is_closed());
        assert_eq!(bob.metrics().snapshot().decode_failures, 1);
    }

    #[tokio::test]
    async fn test_close_emits_once_and_rejects_sends() {
        let (socket, peer) = bound_socket().await;
        let mut events = socket.take_events().unwrap();
        assert!(socket.take_events().is_none());

        assert!(socket.close());
        assert!(!socket.close());

        assert!(matches!(next_event(&mut events).await, SocketEvent::Closed));
        assert!(events.try_recv().is_err());
        assert!(matches!(
            socket.send(&Message::ping(1), &peer).await,
            Err(NetworkError::Closed)
        ));
        assert!(matches!(
            socket.listen(Some(0), Some(LOOPBACK)).await,
            Err(NetworkError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_rebind_fails() {
        let (socket, _) = bound_socket().await;
        assert!(matches!(
            socket.listen(Some(0), Some(LOOPBACK)).await,
            Err(NetworkError::AlreadyBound(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_listen() {
        let socket = PeerTalkSocket::new(PeerTalkConfig::default());
        let result = socket
            .send(&Message::ping(1), &Endpoint::new("127.0.0.1", 4305))
            .await;
        assert!(matches!(result, Err(NetworkError::NotListening)));
    }

    #[tokio::test]
    async fn test_resolve_keeps_scope_id() {
        let local: SocketAddr = "[::]:0".parse().unwrap();
        let target = resolve(local, &Endpoint::new("fe80::1%3", 4305))
            .await
            .unwrap();
        match target {
            SocketAddr::V6(v6) => {
                assert_eq!(v6.ip(), &"fe80::1".parse::<Ipv6Addr>().unwrap());
                assert_eq!(v6.port(), 4305);
                assert_eq!(v6.scope_id(), 3);
            }
            other => panic!("unexpected target: {}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_message_keeps_socket_open() {
        let (alice, _) = bound_socket().await;
        let (_bob, bob_ep) = bound_socket().await;

        let huge = Message::text("msg", "x".repeat(8192));
        assert!(matches!(
            alice.send(&huge, &bob_ep).await,
            Err(NetworkError::Encode(_))
        ));
        assert!(alice.send(&Message::ping(2), &bob_ep).await.is_ok());
        assert_eq!(alice.metrics().snapshot().encode_failures, 1);
    }
}
