//! Handle for calling a peer kite.

use crate::dispatch::HandlerError;
use crate::error::{ClientError, ClientResult};
use crate::local::{callback_func, Kite};
use crate::request::{CallOptions, CallbackArg, Request};
use crate::transport::{Arguments, Connection, ConnectionState, Dialer, Function, TransportError};
use kite_types::{Authentication, KiteIdentity};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{oneshot, watch};
use tracing::debug;

enum Link {
    Detached,
    /// Connection this side dialed and owns.
    Dialed(Arc<dyn Connection>),
    /// Connection the peer dialed. Owned by the transport.
    Accepted(Weak<dyn Connection>),
}

/// A peer kite and the connection used to reach it.
///
/// The credential presented to the peer is fixed when the handle is
/// created. The identity may be refreshed by later calls on the same
/// connection.
pub struct RemoteKite {
    me: Weak<RemoteKite>,
    local: Arc<Kite>,
    kite: RwLock<KiteIdentity>,
    authentication: Option<Authentication>,
    link: RwLock<Link>,
}

impl RemoteKite {
    pub(crate) fn new(
        local: Arc<Kite>,
        kite: KiteIdentity,
        authentication: Option<Authentication>,
    ) -> Arc<Self> {
        Self::with_link(local, kite, authentication, Link::Detached)
    }

    /// A peer that called us on `conn`.
    pub(crate) fn accepted(
        local: Arc<Kite>,
        kite: KiteIdentity,
        authentication: Option<Authentication>,
        conn: &Arc<dyn Connection>,
    ) -> Arc<Self> {
        Self::with_link(local, kite, authentication, Link::Accepted(Arc::downgrade(conn)))
    }

    fn with_link(
        local: Arc<Kite>,
        kite: KiteIdentity,
        authentication: Option<Authentication>,
        link: Link,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local,
            kite: RwLock::new(kite),
            authentication,
            link: RwLock::new(link),
        })
    }

    pub fn identity(&self) -> KiteIdentity {
        self.kite.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn username(&self) -> String {
        self.kite
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .username
            .clone()
    }

    pub(crate) fn set_identity(&self, kite: KiteIdentity) {
        *self.kite.write().unwrap_or_else(|e| e.into_inner()) = kite;
    }

    pub(crate) fn set_username(&self, username: &str) {
        self.kite.write().unwrap_or_else(|e| e.into_inner()).username = username.to_string();
    }

    pub fn authentication(&self) -> Option<&Authentication> {
        self.authentication.as_ref()
    }

    pub fn local_kite(&self) -> Arc<Kite> {
        self.local.clone()
    }

    pub fn connection(&self) -> ClientResult<Arc<dyn Connection>> {
        match &*self.link.read().unwrap_or_else(|e| e.into_inner()) {
            Link::Dialed(conn) => Ok(conn.clone()),
            Link::Accepted(conn) => conn
                .upgrade()
                .ok_or(ClientError::Transport(TransportError::ConnectionLost)),
            Link::Detached => Err(ClientError::NotDialed(self.identity().to_string())),
        }
    }

    /// Peer address of the connection, empty if this side dialed it.
    pub fn remote_addr(&self) -> String {
        self.connection()
            .map(|conn| conn.remote_addr())
            .unwrap_or_default()
    }

    /// Use `conn` to reach the peer from now on.
    pub fn attach(&self, conn: Arc<dyn Connection>) {
        *self.link.write().unwrap_or_else(|e| e.into_inner()) = Link::Dialed(conn);
    }

    /// Create a connection to the peer's URL with `dialer`. Call
    /// [`connect`](Self::connect) to establish it.
    pub fn dial(&self, dialer: &dyn Dialer) -> Arc<dyn Connection> {
        let url = self.identity().url;
        let conn = dialer.connection(&self.local, &url);
        self.attach(conn.clone());
        debug!(url = %url, "Dialing remote kite");
        conn
    }

    pub async fn connect(&self) -> ClientResult<()> {
        self.connection()?.connect().await?;
        Ok(())
    }

    pub fn on_connect(&self, hook: impl Fn() + Send + Sync + 'static) -> ClientResult<()> {
        self.connection()?.on_connect(Arc::new(hook));
        Ok(())
    }

    pub fn on_disconnect(&self, hook: impl Fn() + Send + Sync + 'static) -> ClientResult<()> {
        self.connection()?.on_disconnect(Arc::new(hook));
        Ok(())
    }

    /// Call `method` on the peer and wait for its response.
    ///
    /// Waits until the response callback fires or the connection leaves the
    /// connected state, whichever comes first. There is no timeout.
    pub async fn tell(&self, method: &str, args: Arguments) -> ClientResult<Value> {
        let conn = self.connection()?;

        let (tx, rx) = oneshot::channel::<Arguments>();
        let tx = Mutex::new(Some(tx));
        let response_callback = Function::new(move |args: Arguments| {
            let sender = tx.lock().unwrap_or_else(|e| e.into_inner()).take();
            async move {
                if let Some(sender) = sender {
                    let _ = sender.send(args);
                }
                Ok(())
            }
        });

        let envelope = CallOptions {
            kite: self.local.identity(),
            authentication: self.authentication.clone(),
            with_args: args,
            response_callback: Some(response_callback),
        }
        .encode()?;

        let state = conn.state();
        conn.send(method, Arguments::single(envelope)).await?;

        let response = tokio::select! {
            response = rx => response.map_err(|_| TransportError::ConnectionLost)?,
            _ = disconnected(state) => return Err(TransportError::ConnectionLost.into()),
        };

        let response: CallbackArg = response.one()?.unmarshal()?;
        match response.error {
            Some(err) => Err(ClientError::Remote(err)),
            None => Ok(response.result),
        }
    }

    /// Invoke a callback function the peer passed to us. The peer runs it
    /// without authentication and sends no response.
    pub async fn invoke(&self, f: &Function, args: Arguments) -> ClientResult<()> {
        let envelope = CallOptions {
            kite: self.local.identity(),
            authentication: self.authentication.clone(),
            with_args: args,
            response_callback: None,
        }
        .encode()?;
        f.invoke(Arguments::single(envelope)).await?;
        Ok(())
    }

    /// Wrap `handler` into a function that can be passed to the peer as a
    /// call argument.
    pub fn callback<F, Fut>(&self, handler: F) -> Function
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = callback_func(handler);
        let me = self.me.clone();
        Function::new(move |args: Arguments| {
            let handler = handler.clone();
            let remote = me.upgrade();
            async move {
                let remote = remote.ok_or_else(|| {
                    TransportError::Callback("remote kite is gone".to_string())
                })?;
                remote
                    .local_kite()
                    .run_callback(handler, args, remote)
                    .await;
                Ok(())
            }
        })
    }
}

impl fmt::Debug for RemoteKite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteKite")
            .field("kite", &self.identity())
            .field(
                "authentication",
                &self.authentication.as_ref().map(|auth| &auth.kind),
            )
            .finish()
    }
}

/// Resolves once the connection is no longer connected.
async fn disconnected(mut state: watch::Receiver<ConnectionState>) {
    loop {
        if *state.borrow_and_update() != ConnectionState::Connected {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use kite_types::config::KiteOptions;
    use serde_json::json;

    const KEY: &str = "remote-test-key";

    fn kite(name: &str) -> Arc<Kite> {
        Kite::new(KiteOptions {
            kitename: name.to_string(),
            region: "localhost".to_string(),
            environment: "test".to_string(),
            version: "1.0.0".to_string(),
            koding_key: KEY.to_string(),
            ..KiteOptions::default()
        })
        .unwrap()
    }

    fn math_identity() -> KiteIdentity {
        KiteIdentity::named("math", "ws://math.test:3000/dnode".parse().unwrap())
    }

    #[tokio::test]
    async fn test_tell_before_dial() {
        let remote =
            kite("client").new_remote_kite(math_identity(), Authentication::koding_key(KEY));
        let err = remote.tell("square", Arguments::default()).await.unwrap_err();
        assert!(matches!(err, ClientError::NotDialed(_)));
        assert_eq!(remote.remote_addr(), "");
    }

    #[tokio::test]
    async fn test_tell_fails_while_disconnected() {
        let network = MemoryNetwork::new();
        network.listen("math.test:3000", kite("math"));
        let remote =
            kite("client").new_remote_kite(math_identity(), Authentication::koding_key(KEY));
        remote.dial(&network);

        let err = remote.tell("square", Arguments::default()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_pending_call_fails_on_disconnect() {
        let network = MemoryNetwork::new();
        let math = kite("math");
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let entered_tx = Mutex::new(Some(entered_tx));
        math.handle_func("hang", move |_r: Request| {
            let entered = entered_tx.lock().unwrap().take();
            async move {
                if let Some(entered) = entered {
                    let _ = entered.send(());
                }
                futures::future::pending::<()>().await;
                Ok(json!(null))
            }
        });
        network.listen("math.test:3000", math);
        let client = kite("client");
        let remote = client.new_remote_kite(math_identity(), Authentication::koding_key(KEY));
        let conn = network.dial(&client, &math_identity().url);
        remote.attach(conn.clone());
        remote.connect().await.unwrap();

        let call = tokio::spawn({
            let remote = remote.clone();
            async move { remote.tell("hang", Arguments::default()).await }
        });
        entered_rx.await.unwrap();
        conn.disconnect();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_hooks_follow_connection() {
        let network = MemoryNetwork::new();
        network.listen("math.test:3000", kite("math"));
        let remote =
            kite("client").new_remote_kite(math_identity(), Authentication::koding_key(KEY));
        assert!(remote.on_connect(|| {}).is_err());

        remote.dial(&network);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        remote
            .on_connect(move || {
                let _ = tx.send(());
            })
            .unwrap();
        remote.connect().await.unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
