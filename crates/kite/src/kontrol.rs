//! Kontrol directory client.
//!
//! [`Kontrol`] is a [`RemoteKite`] for the directory service, authenticated
//! with the koding key. Every operation first waits on a readiness gate that
//! opens on the first successful connect and stays open for the lifetime of
//! the client, across later disconnects and reconnects.

use crate::dispatch::HandlerError;
use crate::error::{ClientError, ClientResult};
use crate::local::Kite;
use crate::remote::RemoteKite;
use crate::request::Request;
use crate::transport::{Argument, Arguments, Connection, ConnectionState, Dialer};
use crate::watch::{KiteWatcher, LIVE_EVENT_CAPACITY};
use chrono::Utc;
use kite_types::config::KiteOptions;
use kite_types::identity::join_host_port;
use kite_types::protocol::RegisterOutcome;
use kite_types::{
    Authentication, EventAction, KiteEvent, KiteIdentity, KiteWithToken, KontrolQuery,
    RegisterResult, Token,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One-shot latch. Any number of tasks can wait on it; the first `fire`
/// releases all of them and later ones have no effect.
#[derive(Debug)]
pub struct ReadinessGate {
    ready: watch::Sender<bool>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self { ready }
    }

    /// Open the gate. Returns `true` only for the call that opened it.
    pub fn fire(&self) -> bool {
        self.ready.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_set(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the gate is open.
    pub async fn wait(&self) {
        let mut ready = self.ready.subscribe();
        while !*ready.borrow_and_update() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Client for the Kontrol directory.
pub struct Kontrol {
    remote: Arc<RemoteKite>,
    ready: Arc<ReadinessGate>,
}

impl Kontrol {
    /// Create a client for the Kontrol URL in the local kite's options.
    /// Nothing is sent until [`dial`](Self::dial) connects.
    pub fn new(local: &Arc<Kite>, dialer: &dyn Dialer) -> Self {
        let url = kontrol_url(local);
        let conn = dialer.connection(local, &url);
        Self::with_connection(local, conn)
    }

    /// Create a client over an existing connection.
    pub fn with_connection(local: &Arc<Kite>, conn: Arc<dyn Connection>) -> Self {
        let kite = KiteIdentity::named("kontrol", kontrol_url(local));
        let auth = Authentication::koding_key(local.options().koding_key.clone());
        let remote = local.new_remote_kite(kite, auth);
        remote.attach(conn.clone());

        let ready = Arc::new(ReadinessGate::new());
        let gate = ready.clone();
        conn.on_connect(Arc::new(move || {
            info!("Connected to Kontrol");
            if gate.fire() {
                debug!("Kontrol client is ready");
            }
        }));
        conn.on_disconnect(Arc::new(|| {
            warn!("Disconnected from Kontrol. I will retry in background...");
        }));
        if *conn.state().borrow() == ConnectionState::Connected {
            ready.fire();
        }

        Self { remote, ready }
    }

    /// Connect to Kontrol.
    pub async fn dial(&self) -> ClientResult<()> {
        self.remote.connect().await
    }

    /// Whether the first connect happened.
    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    pub fn remote_kite(&self) -> &Arc<RemoteKite> {
        &self.remote
    }

    /// Register the local kite. On success the local identity takes the
    /// username Kontrol authenticated, and an empty URL host is replaced by
    /// the public address Kontrol saw.
    pub async fn register(&self) -> ClientResult<()> {
        self.ready.wait().await;

        let response = self.remote.tell("register", Arguments::default()).await?;
        let result: RegisterResult = serde_json::from_value(response)?;

        match result.outcome() {
            RegisterOutcome::Allow => {
                let local = self.remote.local_kite();
                local.update_identity(|kite| {
                    kite.username = result.username.clone();
                    if kite.url.hostname().is_empty() {
                        kite.url.host = join_host_port(&result.public_ip, &kite.url.port());
                    }
                });
                let kite = local.identity();
                info!(
                    url = %kite.url,
                    version = %kite.version,
                    id = %kite.id,
                    "Registered to kontrol"
                );
                Ok(())
            }
            RegisterOutcome::Reject => Err(ClientError::KiteRejected),
            RegisterOutcome::Other(result) => Err(ClientError::InvalidResult(result)),
        }
    }

    /// Watch kites matching `query`.
    ///
    /// The watcher yields a `Register` event for every kite that matches
    /// now, then each change Kontrol pushes later. An empty directory is not
    /// an error. Pushed events that cannot be decoded are logged and
    /// skipped. A push waits while the watcher's live buffer is full.
    pub async fn watch_kites(&self, query: KontrolQuery) -> ClientResult<KiteWatcher> {
        self.ready.wait().await;

        let (tx, rx) = mpsc::channel(LIVE_EVENT_CAPACITY);
        let on_event = self.remote.callback(move |r: Request| {
            let tx = tx.clone();
            async move {
                let event: KiteEvent = r.args.slice_of_length(1)?[0].unmarshal()?;
                if tx.send(event).await.is_err() {
                    debug!("Kite watcher is closed, dropping event");
                }
                Ok::<(), HandlerError>(())
            }
        });

        let args = Arguments::new(vec![Argument::value(&query)?, Argument::Function(on_event)]);
        let kites = match self.fetch_kites(args).await {
            Ok(kites) => kites,
            Err(ClientError::NoKitesAvailable) => Vec::new(),
            Err(err) => return Err(err),
        };

        let now = Utc::now();
        let snapshot = kites.iter().map(|remote| KiteEvent {
            action: EventAction::Register,
            kite: remote.identity(),
            token: remote.authentication().map(|auth| Token {
                key: auth.key.clone(),
                ttl: auth.remaining_ttl(now),
            }),
        });
        Ok(KiteWatcher::new(snapshot.collect::<Vec<_>>(), rx))
    }

    /// Watch kites matching `query`, calling `on_event` for every event on a
    /// background task. `on_event` should not block.
    pub async fn watch_kites_with<F>(
        &self,
        query: KontrolQuery,
        mut on_event: F,
    ) -> ClientResult<JoinHandle<()>>
    where
        F: FnMut(KiteEvent) + Send + 'static,
    {
        let mut watcher = self.watch_kites(query).await?;
        Ok(tokio::spawn(async move {
            while let Some(event) = watcher.next_event().await {
                on_event(event);
            }
        }))
    }

    /// Kites matching `query`, ready to dial. Fails with
    /// [`ClientError::NoKitesAvailable`] when nothing matches.
    pub async fn get_kites(&self, query: KontrolQuery) -> ClientResult<Vec<Arc<RemoteKite>>> {
        self.fetch_kites(Arguments::single(Argument::value(&query)?))
            .await
    }

    async fn fetch_kites(&self, args: Arguments) -> ClientResult<Vec<Arc<RemoteKite>>> {
        self.ready.wait().await;

        let response = self.remote.tell("getKites", args).await?;
        let kites: Option<Vec<KiteWithToken>> = serde_json::from_value(response)?;
        let kites = kites.unwrap_or_default();
        if kites.is_empty() {
            return Err(ClientError::NoKitesAvailable);
        }

        let local = self.remote.local_kite();
        Ok(kites
            .into_iter()
            .map(|entry| {
                let auth = Authentication::token(entry.token.key, entry.token.ttl);
                local.new_remote_kite(entry.kite, auth)
            })
            .collect())
    }

    /// Ask Kontrol for a token to call `kite`.
    pub async fn get_token(&self, kite: &KiteIdentity) -> ClientResult<Token> {
        self.ready.wait().await;

        let response = self
            .remote
            .tell("getToken", Arguments::single(Argument::value(kite)?))
            .await?;
        Ok(serde_json::from_value(response)?)
    }
}

fn kontrol_url(local: &Kite) -> kite_types::KiteUrl {
    local
        .options()
        .kontrol_url
        .clone()
        .unwrap_or_else(KiteOptions::default_kontrol_url)
}
