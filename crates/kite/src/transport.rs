//! Transport contract between kites.
//!
//! A [`Connection`] carries method calls in both directions. Call arguments
//! are JSON values that may embed [`Function`]s: callbacks created by the
//! sender that the receiver can invoke later. The transport routes such an
//! invocation back to the side that created the function.
//!
//! Every connection also carries a typed [`ConnectionContext`] where the
//! dispatcher caches the [`RemoteKite`] of the peer, and a
//! [`ConnectionState`] watch channel for connect/disconnect notifications.

use crate::local::Kite;
use crate::remote::RemoteKite;
use async_trait::async_trait;
use futures::future::BoxFuture;
use kite_types::KiteUrl;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;
use tokio::sync::watch;

/// Connect/disconnect notification hook.
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Errors raised by a connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection lost")]
    ConnectionLost,
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("Callback failed: {0}")]
    Callback(String),
}

/// Malformed or unexpected call arguments.
#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("Expected {expected} arguments, got {got}")]
    WrongLength { expected: usize, got: usize },
    #[error("Argument is not a function")]
    NotAFunction,
    #[error("Argument is not a list")]
    NotAList,
    #[error("Argument is not an object")]
    NotAnObject,
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Cannot decode argument: {0}")]
    Decode(#[from] serde_json::Error),
}

type FunctionBody =
    dyn Fn(Arguments) -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync;

/// A callable argument. Invoking it runs the callback on the side that
/// created it.
#[derive(Clone)]
pub struct Function(Arc<FunctionBody>);

impl Function {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        Self(Arc::new(
            move |args: Arguments| -> BoxFuture<'static, Result<(), TransportError>> {
                Box::pin(f(args))
            },
        ))
    }

    pub async fn invoke(&self, args: Arguments) -> Result<(), TransportError> {
        (self.0)(args).await
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[Function]")
    }
}

/// One call argument: plain JSON, a function, or a container holding
/// functions somewhere inside.
#[derive(Debug, Clone)]
pub enum Argument {
    Value(Value),
    Function(Function),
    List(Vec<Argument>),
    Map(BTreeMap<String, Argument>),
}

impl Argument {
    /// Serialize `value` into a plain argument.
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Result<Self, ArgumentError> {
        Ok(Argument::Value(serde_json::to_value(value)?))
    }

    /// JSON view of the argument. Functions show up as `"[Function]"`.
    pub fn to_json(&self) -> Value {
        match self {
            Argument::Value(v) => v.clone(),
            Argument::Function(_) => Value::String("[Function]".to_string()),
            Argument::List(items) => Value::Array(items.iter().map(Argument::to_json).collect()),
            Argument::Map(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T, ArgumentError> {
        Ok(serde_json::from_value(self.to_json())?)
    }

    pub fn function(&self) -> Result<Function, ArgumentError> {
        match self {
            Argument::Function(f) => Ok(f.clone()),
            _ => Err(ArgumentError::NotAFunction),
        }
    }

    pub fn into_list(self) -> Result<Vec<Argument>, ArgumentError> {
        match self {
            Argument::List(items) => Ok(items),
            Argument::Value(Value::Array(items)) => {
                Ok(items.into_iter().map(Argument::Value).collect())
            }
            _ => Err(ArgumentError::NotAList),
        }
    }

    /// Field `key` of an object argument. `None` when absent or null.
    pub fn field(&self, key: &str) -> Result<Option<Argument>, ArgumentError> {
        match self {
            Argument::Map(fields) => Ok(fields.get(key).cloned()),
            Argument::Value(Value::Object(fields)) => Ok(fields
                .get(key)
                .filter(|v| !v.is_null())
                .cloned()
                .map(Argument::Value)),
            _ => Err(ArgumentError::NotAnObject),
        }
    }
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Value(value)
    }
}

impl From<Function> for Argument {
    fn from(f: Function) -> Self {
        Argument::Function(f)
    }
}

/// The positional arguments of a call.
#[derive(Debug, Clone, Default)]
pub struct Arguments(Vec<Argument>);

impl Arguments {
    pub fn new(args: Vec<Argument>) -> Self {
        Self(args)
    }

    pub fn single(arg: impl Into<Argument>) -> Self {
        Self(vec![arg.into()])
    }

    /// The only argument. Fails unless there is exactly one.
    pub fn one(&self) -> Result<&Argument, ArgumentError> {
        Ok(&self.slice_of_length(1)?[0])
    }

    /// All arguments, checking that there are exactly `n`.
    pub fn slice_of_length(&self, n: usize) -> Result<&[Argument], ArgumentError> {
        if self.0.len() != n {
            return Err(ArgumentError::WrongLength {
                expected: n,
                got: self.0.len(),
            });
        }
        Ok(&self.0)
    }

    /// Decode all arguments as one JSON array, e.g. into a tuple.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T, ArgumentError> {
        let json = Value::Array(self.0.iter().map(Argument::to_json).collect());
        Ok(serde_json::from_value(json)?)
    }

    pub fn get(&self, index: usize) -> Option<&Argument> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Argument> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<Argument> {
        self.0
    }
}

impl From<Vec<Argument>> for Arguments {
    fn from(args: Vec<Argument>) -> Self {
        Self(args)
    }
}

/// Connection lifecycle as seen by its owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// State channel plus connect/disconnect hooks, shared by transport
/// implementations.
pub struct ConnectionEvents {
    state: watch::Sender<ConnectionState>,
    on_connect: Mutex<Vec<Hook>>,
    on_disconnect: Mutex<Vec<Hook>>,
}

impl ConnectionEvents {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            on_connect: Mutex::new(Vec::new()),
            on_disconnect: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn on_connect(&self, hook: Hook) {
        self.on_connect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub fn on_disconnect(&self, hook: Hook) {
        self.on_disconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    /// Move to `to`. Connect hooks fire when entering `Connected`,
    /// disconnect hooks when leaving it. Hooks run after the state is
    /// published, outside of any lock.
    pub fn transition(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        let hooks = match (
            from == ConnectionState::Connected,
            to == ConnectionState::Connected,
        ) {
            (false, true) => &self.on_connect,
            (true, false) => &self.on_disconnect,
            _ => return,
        };
        let hooks: Vec<Hook> = hooks.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for hook in hooks {
            hook();
        }
    }
}

impl Default for ConnectionEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed per-connection storage.
#[derive(Default)]
pub struct ConnectionContext {
    remote_kite: OnceLock<Arc<RemoteKite>>,
}

impl ConnectionContext {
    /// The peer cached on this connection, if a call arrived already.
    pub fn remote_kite(&self) -> Option<Arc<RemoteKite>> {
        self.remote_kite.get().cloned()
    }

    /// Return the cached peer, creating it with `init` on first use.
    /// The flag is `true` when this call created it.
    pub fn remote_kite_or_init(
        &self,
        init: impl FnOnce() -> Arc<RemoteKite>,
    ) -> (Arc<RemoteKite>, bool) {
        let mut created = false;
        let remote = self.remote_kite.get_or_init(|| {
            created = true;
            init()
        });
        (remote.clone(), created)
    }
}

/// A bidirectional RPC connection to one peer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Establish the connection. A no-op when already connected.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Send a method call. Results come back through functions embedded in
    /// `args`.
    async fn send(&self, method: &str, args: Arguments) -> Result<(), TransportError>;

    /// Address of the peer. Empty when this side dialed the connection.
    fn remote_addr(&self) -> String;

    fn on_connect(&self, hook: Hook);

    fn on_disconnect(&self, hook: Hook);

    fn state(&self) -> watch::Receiver<ConnectionState>;

    fn context(&self) -> &ConnectionContext;
}

/// Creates outgoing connections.
pub trait Dialer: Send + Sync {
    /// A new, not yet connected, connection from `local` to `url`.
    fn connection(&self, local: &Arc<Kite>, url: &KiteUrl) -> Arc<dyn Connection>;
}
