//! In-process transport.
//!
//! A [`MemoryNetwork`] maps `host:port` strings to listening kites. Dialing
//! gives a [`MemoryConnection`]; connecting creates the accepted end on the
//! listener's side. A call sent on one end is dispatched by the kite that
//! owns the other end, on its own task.

use crate::local::Kite;
use crate::transport::{
    Arguments, Connection, ConnectionContext, ConnectionEvents, ConnectionState, Dialer, Hook,
    TransportError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use kite_types::KiteUrl;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Default)]
struct NetworkInner {
    listeners: DashMap<String, Arc<Kite>>,
    next_conn: AtomicU64,
}

/// Registry of listening kites, addressed by `host:port`.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept connections to `host` on behalf of `kite`.
    pub fn listen(&self, host: impl Into<String>, kite: Arc<Kite>) {
        let host = host.into();
        info!(host = %host, kite = %kite.identity().name, "Listening on memory network");
        self.inner.listeners.insert(host, kite);
    }

    /// Stop accepting new connections to `host`. Established connections
    /// stay up.
    pub fn unlisten(&self, host: &str) -> bool {
        self.inner.listeners.remove(host).is_some()
    }

    pub fn dial(&self, local: &Arc<Kite>, url: &KiteUrl) -> Arc<MemoryConnection> {
        let network = self.clone();
        let local = local.clone();
        let target = url.host.clone();
        Arc::new_cyclic(|me| MemoryConnection {
            me: me.clone(),
            network,
            local,
            target,
            remote_addr: String::new(),
            peer: Mutex::new(Peer::None),
            events: ConnectionEvents::new(),
            context: ConnectionContext::default(),
        })
    }
}

impl Dialer for MemoryNetwork {
    fn connection(&self, local: &Arc<Kite>, url: &KiteUrl) -> Arc<dyn Connection> {
        self.dial(local, url)
    }
}

enum Peer {
    None,
    /// Held by the dialing end.
    Accepted(Arc<MemoryConnection>),
    /// Held by the accepted end.
    Dialer(Weak<MemoryConnection>),
}

impl Peer {
    fn upgrade(&self) -> Option<Arc<MemoryConnection>> {
        match self {
            Peer::None => None,
            Peer::Accepted(conn) => Some(conn.clone()),
            Peer::Dialer(conn) => conn.upgrade(),
        }
    }
}

/// One end of an in-process connection.
pub struct MemoryConnection {
    me: Weak<MemoryConnection>,
    network: MemoryNetwork,
    /// Kite that dispatches calls arriving on this end.
    local: Arc<Kite>,
    /// Listener address. Empty on accepted ends.
    target: String,
    remote_addr: String,
    peer: Mutex<Peer>,
    events: ConnectionEvents,
    context: ConnectionContext,
}

impl MemoryConnection {
    fn accepted(network: &MemoryNetwork, listener: Arc<Kite>, dialer: Weak<Self>) -> Arc<Self> {
        let id = network.inner.next_conn.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new_cyclic(|me| MemoryConnection {
            me: me.clone(),
            network: network.clone(),
            local: listener,
            target: String::new(),
            remote_addr: format!("memory:{id}"),
            peer: Mutex::new(Peer::Dialer(dialer)),
            events: ConnectionEvents::new(),
            context: ConnectionContext::default(),
        })
    }

    fn take_peer(&self) -> Peer {
        let mut peer = self.peer.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *peer, Peer::None)
    }

    fn set_peer(&self, peer: Peer) {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner()) = peer;
    }

    /// Drop the link between both ends. Both sides observe the disconnect;
    /// the dialing end can `connect` again afterwards.
    pub fn disconnect(&self) {
        match self.take_peer() {
            Peer::None => {}
            Peer::Accepted(accepted) => {
                accepted.set_peer(Peer::None);
                accepted.events.transition(ConnectionState::Disconnected);
                self.events.transition(ConnectionState::Disconnected);
            }
            Peer::Dialer(dialer) => {
                if let Some(dialer) = dialer.upgrade() {
                    dialer.set_peer(Peer::None);
                    dialer.events.transition(ConnectionState::Disconnected);
                }
                self.events.transition(ConnectionState::Disconnected);
            }
        }
        debug!(target = %self.target, "Memory connection closed");
    }

    pub fn is_connected(&self) -> bool {
        self.events.state() == ConnectionState::Connected
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.target.is_empty() || self.is_connected() {
            return Ok(());
        }
        self.events.transition(ConnectionState::Connecting);

        let listener = self
            .network
            .inner
            .listeners
            .get(&self.target)
            .map(|entry| entry.value().clone());
        let Some(listener) = listener else {
            self.events.transition(ConnectionState::Disconnected);
            return Err(TransportError::ConnectionRefused(self.target.clone()));
        };

        let accepted = Self::accepted(&self.network, listener, self.me.clone());
        self.set_peer(Peer::Accepted(accepted.clone()));
        accepted.events.transition(ConnectionState::Connected);
        self.events.transition(ConnectionState::Connected);
        debug!(
            target = %self.target,
            remote = %accepted.remote_addr,
            "Memory connection established"
        );
        Ok(())
    }

    async fn send(&self, method: &str, args: Arguments) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let peer = self
            .peer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
            .ok_or(TransportError::NotConnected)?;
        let kite = peer.local.clone();
        let conn: Arc<dyn Connection> = peer;
        tokio::spawn(kite.run_method(method.to_string(), args, conn));
        Ok(())
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn on_connect(&self, hook: Hook) {
        self.events.on_connect(hook);
    }

    fn on_disconnect(&self, hook: Hook) {
        self.events.on_disconnect(hook);
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    fn context(&self) -> &ConnectionContext {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_types::config::KiteOptions;

    fn kite(name: &str) -> Arc<Kite> {
        Kite::new(KiteOptions {
            kitename: name.to_string(),
            region: "localhost".to_string(),
            environment: "test".to_string(),
            version: "1.0.0".to_string(),
            koding_key: "memory-key".to_string(),
            ..KiteOptions::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_refused_without_listener() {
        let network = MemoryNetwork::new();
        let conn = network.dial(&kite("client"), &"ws://nowhere:1/dnode".parse().unwrap());
        assert_eq!(
            conn.connect().await,
            Err(TransportError::ConnectionRefused("nowhere:1".to_string()))
        );
        assert_eq!(*conn.state().borrow(), ConnectionState::Disconnected);
        assert_eq!(
            conn.send("ping", Arguments::default()).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let network = MemoryNetwork::new();
        network.listen("server:3000", kite("server"));
        let conn = network.dial(&kite("client"), &"ws://server:3000/dnode".parse().unwrap());
        assert_eq!(conn.remote_addr(), "");

        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        let accepted = conn.take_peer();
        let Peer::Accepted(accepted) = accepted else {
            panic!("dialer should hold the accepted end");
        };
        assert_eq!(accepted.remote_addr(), "memory:1");
        assert!(accepted.is_connected());
        conn.set_peer(Peer::Accepted(accepted.clone()));

        accepted.disconnect();
        assert!(!conn.is_connected());
        assert!(!accepted.is_connected());

        conn.connect().await.unwrap();
        assert!(conn.is_connected());
    }

    #[test]
    fn test_unlisten() {
        let network = MemoryNetwork::new();
        network.listen("server:3000", kite("server"));
        assert!(network.unlisten("server:3000"));
        assert!(!network.unlisten("server:3000"));
    }
}
