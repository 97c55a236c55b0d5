//! Peer discovery engine for PeerTalk
//!
//! Reacts to socket events and drives gossip: answers pings, serves boot
//! requests from the trusted set, collects gossiped peers as pending and
//! promotes every peer that completes an exchange. Peers sending commands
//! outside the vocabulary are dropped from the registry.
//!
//! There is no per-peer session state beyond registry membership, and no
//! retry or timeout tracking: a lost ping simply never yields a pong.

use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PeerTalkConfig;
use crate::error::{NetworkError, Result};
use crate::peers::{Endpoint, PeerDescriptor, PeerRegistry};
use crate::protocol::{now_millis, Command, Message};
use crate::transport::{PeerTalkSocket, SocketEvent};

/// Notifications delivered to the owner of a running client.
#[derive(Debug)]
pub enum Notification {
    /// An inbound message, after the engine acted on it.
    Message {
        command: Command,
        message: Message,
        from: Endpoint,
    },
    DecodeError {
        from: Endpoint,
        error: NetworkError,
    },
    /// A reply could not be encoded or sent.
    SendFailed {
        to: Endpoint,
        error: NetworkError,
    },
    Fatal(NetworkError),
    Closed,
}

/// Discovery client: a [`PeerTalkSocket`] plus the peer registry it maintains.
pub struct PeerTalkClient {
    socket: PeerTalkSocket,
    registry: Mutex<PeerRegistry>,
    notifications_tx: mpsc::UnboundedSender<Notification>,
    notifications_rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    closed_notified: AtomicBool,
}

impl PeerTalkClient {
    pub fn new(config: PeerTalkConfig) -> Result<Self> {
        let registry = PeerRegistry::new(&config);
        Self::with_registry(config, registry)
    }

    /// Client using a caller-supplied registry, e.g. one with a fixed seed.
    pub fn with_registry(config: PeerTalkConfig, registry: PeerRegistry) -> Result<Self> {
        config.validate()?;
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();

        Ok(Self {
            socket: PeerTalkSocket::new(config),
            registry: Mutex::new(registry),
            notifications_tx,
            notifications_rx: Mutex::new(Some(notifications_rx)),
            event_task: Mutex::new(None),
            closed_notified: AtomicBool::new(false),
        })
    }

    pub fn socket(&self) -> &PeerTalkSocket {
        &self.socket
    }

    pub async fn listen(&self, port: Option<u16>, address: Option<IpAddr>) -> Result<SocketAddr> {
        self.socket.listen(port, address).await
    }

    /// Take the notification stream. Returns `None` after the first call.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications_rx.lock().take()
    }

    /// Spawn the event loop. Events are handled one at a time, in arrival order.
    ///
    /// Fails with [`NetworkError::Closed`] once the socket has been closed.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.socket.is_closed() {
            return Err(NetworkError::Closed);
        }
        let events = self
            .socket
            .take_events()
            .ok_or(NetworkError::AlreadyStarted)?;

        let client = Arc::clone(self);
        let handle = tokio::spawn(async move { client.run(events).await });
        *self.event_task.lock() = Some(handle);

        info!("PeerTalk discovery engine started");
        Ok(())
    }

    /// Close the socket. The event loop drains and exits on the resulting
    /// `Closed` event.
    pub fn close(&self) {
        let closed_now = self.socket.close();
        // Without a running loop nobody forwards the socket's `Closed` event.
        if closed_now && self.event_task.lock().is_none() {
            self.notify_closed();
        }
    }

    async fn run(&self, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
        while let Some(event) = events.recv().await {
            if !self.dispatch(event).await {
                break;
            }
        }
        debug!("PeerTalk event loop finished");
    }

    /// Handle one socket event. Returns `false` once the socket has closed.
    async fn dispatch(&self, event: SocketEvent) -> bool {
        match event {
            SocketEvent::Message {
                command,
                message,
                from,
            } => {
                if let Some(reply) = self.handle_message(command, &message, &from) {
                    if let Err(error) = self.socket.send(&reply, &from).await {
                        warn!("Failed to reply to {}: {}", from, error);
                        self.notify(Notification::SendFailed {
                            to: from.clone(),
                            error,
                        });
                    }
                }
                self.notify(Notification::Message {
                    command,
                    message,
                    from,
                });
                true
            }
            SocketEvent::DecodeError { from, error } => {
                self.notify(Notification::DecodeError { from, error });
                true
            }
            SocketEvent::Fatal(error) => {
                error!("PeerTalk socket failed: {}", error);
                self.notify(Notification::Fatal(error));
                true
            }
            SocketEvent::Closed => {
                self.notify_closed();
                false
            }
        }
    }

    /// Apply one inbound message to the registry and build the reply, if any.
    pub fn handle_message(
        &self,
        command: Command,
        message: &Message,
        from: &Endpoint,
    ) -> Option<Message> {
        let mut registry = self.registry.lock();

        match command {
            Command::Ping => {
                trust(&mut registry, from);
                Some(Message::pong(now_millis()))
            }
            Command::Pong => {
                trust(&mut registry, from);
                None
            }
            Command::Query => {
                let requested = message.count.unwrap_or(1).max(1);
                let requested = usize::try_from(requested).unwrap_or(usize::MAX);
                let peers = registry.sample(requested);
                debug!("Serving {} peers to {}", peers.len(), from);
                trust(&mut registry, from);
                Some(Message::peer_list(self.socket.config().version, &peers))
            }
            Command::PeerList => {
                for descriptor in &message.peers {
                    match registry.add_pending(descriptor.clone()) {
                        Ok(endpoint) => debug!("Learned pending peer {} from {}", endpoint, from),
                        Err(err) => debug!("Ignoring gossiped peer from {}: {}", from, err),
                    }
                }
                trust(&mut registry, from);
                None
            }
            Command::Assert => {
                debug!("Ignoring assert from {}", from);
                None
            }
            Command::Unknown => {
                warn!("Unknown command {:?} from {}, dropping peer", message.query, from);
                if let Err(err) = registry.remove(from) {
                    debug!("Failed to remove {}: {}", from, err);
                }
                None
            }
        }
    }

    pub async fn ping(&self, to: &Endpoint) -> Result<usize> {
        self.socket.send(&Message::ping(now_millis()), to).await
    }

    /// Ask `to` for up to `count` of its trusted peers.
    pub async fn request_peers(&self, to: &Endpoint, count: usize) -> Result<usize> {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        self.socket.send(&Message::query(count), to).await
    }

    pub async fn send(&self, message: &Message, to: &Endpoint) -> Result<usize> {
        self.socket.send(message, to).await
    }

    /// Seed the registry with a peer we have not talked to yet.
    pub fn add_bootstrap_peer(&self, peer: impl Into<PeerDescriptor>) -> Result<Endpoint> {
        self.registry.lock().add_pending(peer)
    }

    pub fn is_trusted(&self, endpoint: &Endpoint) -> bool {
        self.registry.lock().contains(endpoint)
    }

    pub fn is_pending(&self, endpoint: &Endpoint) -> bool {
        self.registry.lock().is_pending(endpoint)
    }

    pub fn trusted_peers(&self) -> Vec<Endpoint> {
        self.registry.lock().trusted()
    }

    pub fn pending_peers(&self) -> Vec<Endpoint> {
        self.registry.lock().pending()
    }

    fn notify(&self, notification: Notification) {
        if self.notifications_tx.send(notification).is_err() {
            debug!("Notification dropped, receiver is gone");
        }
    }

    /// `Closed` reaches the owner at most once.
    fn notify_closed(&self) {
        if !self.closed_notified.swap(true, Ordering::SeqCst) {
            self.notify(Notification::Closed);
        }
    }
}

fn trust(registry: &mut PeerRegistry, from: &Endpoint) {
    if let Err(err) = registry.promote(from) {
        warn!("Failed to promote {}: {}", from, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode;
    use serde_json::json;

    fn client() -> PeerTalkClient {
        let config = PeerTalkConfig::with_peer_limit(16);
        let registry = PeerRegistry::with_seed(&config, 42);
        PeerTalkClient::with_registry(config, registry).unwrap()
    }

    fn peer(n: u8) -> Endpoint {
        Endpoint::new(format!("192.0.2.{}", n), 4305)
    }

    #[test]
    fn test_ping_replies_pong_and_trusts_sender() {
        let client = client();
        let alice = peer(1);

        let before = now_millis();
        let reply = client
            .handle_message(Command::Ping, &Message::ping(1000), &alice)
            .expect("ping must be answered");

        assert_eq!(reply.command(), Command::Pong);
        assert!(reply.timestamp.unwrap() >= before);
        assert!(client.is_trusted(&alice));
    }

    #[test]
    fn test_peer_list_adds_pending_and_trusts_sender() {
        let client = client();
        let bob = peer(2);
        let mut message = Message::new("peers");
        message.peers = vec![
            PeerDescriptor::new("2001:db8::1", 4305),
            PeerDescriptor::address(42),
            PeerDescriptor::new(json!(null), 1),
        ];

        assert!(client
            .handle_message(Command::PeerList, &message, &bob)
            .is_none());

        assert_eq!(client.pending_peers(), vec![Endpoint::new("2001:db8::1", 4305)]);
        assert!(client.is_trusted(&bob));
    }

    #[test]
    fn test_decoded_peer_list_with_bad_entries_still_trusts_sender() {
        let client = client();
        let bob = peer(2);
        let bytes = rmp_serde::to_vec_named(&json!({
            "q": "peers",
            "peers": [{"address": "2001:db8::7", "port": "9000"}, 7, [1, 2], {"address": ""}],
        }))
        .unwrap();

        let (command, message) = decode(&bytes).unwrap();
        assert!(client.handle_message(command, &message, &bob).is_none());
        assert_eq!(client.pending_peers(), vec![Endpoint::new("2001:db8::7", 9000)]);
        assert!(client.is_trusted(&bob));

        let bytes = rmp_serde::to_vec_named(&json!({"q": "peers", "peers": "nope"})).unwrap();
        let (command, message) = decode(&bytes).unwrap();
        let carol = peer(3);
        assert!(client.handle_message(command, &message, &carol).is_none());
        assert_eq!(client.pending_peers().len(), 1);
        assert!(client.is_trusted(&carol));
    }

    #[tokio::test]
    async fn test_start_after_close_is_refused() {
        let client = Arc::new(client());
        client
            .listen(Some(0), Some(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)))
            .await
            .unwrap();
        let mut notifications = client.take_notifications().unwrap();

        client.close();
        assert!(matches!(client.start(), Err(NetworkError::Closed)));
        client.close();

        assert!(matches!(notifications.try_recv(), Ok(Notification::Closed)));
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_forwarded_once_by_running_loop() {
        let client = Arc::new(client());
        client
            .listen(Some(0), Some(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)))
            .await
            .unwrap();
        let mut notifications = client.take_notifications().unwrap();
        client.start().unwrap();

        client.close();
        let first = tokio::time::timeout(std::time::Duration::from_secs(5), notifications.recv())
            .await
            .expect("timed out waiting for close")
            .expect("notification stream");
        assert!(matches!(first, Notification::Closed));

        client.close();
        tokio::task::yield_now().await;
        assert!(notifications.try_recv().is_err());
    }

    #[test]
    fn test_unknown_command_drops_sender() {
        let client = client();
        let carol = peer(3);
        client.handle_message(Command::Ping, &Message::ping(1), &carol);
        assert!(client.is_trusted(&carol));

        let garbage = Message::new("garbage-xyz");
        assert!(client
            .handle_message(garbage.command(), &garbage, &carol)
            .is_none());
        assert!(!client.is_trusted(&carol));
        assert!(!client.is_pending(&carol));
    }

    #[test]
    fn test_query_samples_trusted_peers() {
        let client = client();
        for n in 1..=3 {
            client.handle_message(Command::Pong, &Message::pong(1), &peer(n));
        }
        client.add_bootstrap_peer(peer(9)).unwrap();
        let requester = peer(7);

        let reply = client
            .handle_message(Command::Query, &Message::query(2), &requester)
            .unwrap();
        assert_eq!(reply.command(), Command::PeerList);
        assert_eq!(reply.peers.len(), 2);
        for descriptor in &reply.peers {
            let endpoint = Endpoint::normalize(descriptor, 4305).unwrap();
            assert!((1..=3).map(peer).any(|p| p == endpoint));
        }
        assert!(client.is_trusted(&requester));
    }

    #[test]
    fn test_query_count_is_clamped() {
        let client = client();
        for n in 1..=5 {
            client.handle_message(Command::Pong, &Message::pong(1), &peer(n));
        }

        let reply = client
            .handle_message(Command::Query, &Message::query(-4), &peer(6))
            .unwrap();
        assert_eq!(reply.peers.len(), 1);

        let reply = client
            .handle_message(Command::Query, &Message::new("query"), &peer(6))
            .unwrap();
        assert_eq!(reply.peers.len(), 1);

        let reply = client
            .handle_message(Command::Query, &Message::query(1_000), &peer(6))
            .unwrap();
        assert_eq!(reply.peers.len(), 6);
    }

    #[test]
    fn test_assert_leaves_registry_alone() {
        let client = client();
        let dave = peer(4);
        assert!(client
            .handle_message(Command::Assert, &Message::new("assert"), &dave)
            .is_none());
        assert!(!client.is_trusted(&dave));
        assert!(!client.is_pending(&dave));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PeerTalkConfig::with_peer_limit(0);
        assert!(PeerTalkClient::new(config).is_err());
    }
}
