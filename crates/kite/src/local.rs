//! The local kite: identity plus handler and authenticator registries.

use crate::auth::{authenticate_from_koding_key, authenticate_from_token, AuthError};
use crate::dispatch::{CallbackFunc, HandlerError, HandlerResult};
use crate::remote::RemoteKite;
use crate::request::Request;
use dashmap::DashMap;
use futures::future::BoxFuture;
use kite_types::config::{ConfigError, KiteOptions};
use kite_types::identity::join_host_port;
use kite_types::{Authentication, KiteIdentity, KiteUrl};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Handler bound to a method name.
pub type HandlerFunc = Arc<dyn Fn(Request) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Credential check for one authentication type. Sets `Request::username`
/// on success.
pub type Authenticator = Arc<dyn Fn(&mut Request) -> Result<(), AuthError> + Send + Sync>;

/// Called once for every new peer that calls this kite.
pub type RemoteKiteObserver = Arc<dyn Fn(Arc<RemoteKite>) + Send + Sync>;

/// A kite service running in this process.
pub struct Kite {
    options: KiteOptions,
    id: String,
    identity: RwLock<KiteIdentity>,
    handlers: DashMap<String, HandlerFunc>,
    authenticators: DashMap<String, Authenticator>,
    authentication_enabled: AtomicBool,
    observers: RwLock<Vec<RemoteKiteObserver>>,
}

impl Kite {
    /// Validate `options` and build a kite with the built-in `kodingKey`
    /// and `token` authenticators.
    pub fn new(mut options: KiteOptions) -> Result<Arc<Self>, ConfigError> {
        options.validate()?;

        let id = uuid::Uuid::new_v4().to_string();
        let hostname = if options.hostname.is_empty() {
            std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "localhost".to_string())
        } else {
            options.hostname.clone()
        };
        let identity = KiteIdentity {
            username: options.username.clone(),
            environment: options.environment.clone(),
            name: options.kitename.clone(),
            version: options.version.clone(),
            region: options.region.clone(),
            hostname,
            id: id.clone(),
            url: KiteUrl::new(
                "ws",
                join_host_port(&options.public_ip, &options.port),
                "/dnode",
            ),
            visibility: options.visibility,
        };

        let kite = Arc::new(Self {
            authentication_enabled: AtomicBool::new(!options.disable_authentication),
            options,
            id,
            identity: RwLock::new(identity),
            handlers: DashMap::new(),
            authenticators: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        });
        kite.handle_authenticator(Authentication::KODING_KEY, authenticate_from_koding_key);
        kite.handle_authenticator(Authentication::TOKEN, authenticate_from_token);

        info!(kite = %kite.identity(), "Kite created");
        Ok(kite)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the current identity.
    pub fn identity(&self) -> KiteIdentity {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Mutate the identity in place, e.g. after Kontrol corrected it.
    pub fn update_identity(&self, f: impl FnOnce(&mut KiteIdentity)) {
        let mut identity = self.identity.write().unwrap_or_else(|e| e.into_inner());
        f(&mut identity);
    }

    pub fn options(&self) -> &KiteOptions {
        &self.options
    }

    /// Register `handler` for `method`, replacing any previous one.
    pub fn handle_func<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let method = method.into();
        let handler: HandlerFunc =
            Arc::new(move |r: Request| -> BoxFuture<'static, HandlerResult> {
                Box::pin(handler(r))
            });
        debug!(method = %method, "Handler registered");
        self.handlers.insert(method, handler);
    }

    /// Register an authenticator for credentials tagged `kind`.
    pub fn handle_authenticator<F>(&self, kind: impl Into<String>, f: F)
    where
        F: Fn(&mut Request) -> Result<(), AuthError> + Send + Sync + 'static,
    {
        self.authenticators.insert(kind.into(), Arc::new(f));
    }

    /// Turn call authentication on or off. Enabled unless the options
    /// disable it.
    pub fn set_authentication(&self, enabled: bool) {
        self.authentication_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn authentication_enabled(&self) -> bool {
        self.authentication_enabled.load(Ordering::SeqCst)
    }

    /// Run `observer` for every peer the first time it calls this kite on a
    /// connection.
    pub fn on_remote_kite_connected(
        &self,
        observer: impl Fn(Arc<RemoteKite>) + Send + Sync + 'static,
    ) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(observer));
    }

    pub(crate) fn notify_remote_kite_connected(&self, remote: &Arc<RemoteKite>) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer(remote.clone());
        }
    }

    /// A handle for calling `kite`, presenting `authentication`. Attach a
    /// connection with [`RemoteKite::dial`] before calling it.
    pub fn new_remote_kite(
        self: &Arc<Self>,
        kite: KiteIdentity,
        authentication: Authentication,
    ) -> Arc<RemoteKite> {
        RemoteKite::new(self.clone(), kite, Some(authentication))
    }

    pub(crate) fn handler(&self, method: &str) -> Option<HandlerFunc> {
        self.handlers.get(method).map(|h| h.value().clone())
    }

    pub(crate) fn authenticator(&self, kind: &str) -> Option<Authenticator> {
        self.authenticators.get(kind).map(|a| a.value().clone())
    }
}

/// Wrap an async callback handler for [`RemoteKite::callback`].
pub(crate) fn callback_func<F, Fut>(handler: F) -> CallbackFunc
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |r: Request| -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(handler(r))
    })
}
