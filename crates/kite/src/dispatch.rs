//! Inbound call dispatch.
//!
//! [`Kite::run_method`] is the entry point a transport uses for every
//! inbound method call. It resolves the handler, decodes the envelope,
//! caches the caller on the connection, authenticates, runs the handler and
//! delivers exactly one `{error, result}` to the caller's response callback.
//! Errors and panics raised anywhere in that chain are converted into a
//! [`KiteError`] at a single point; nothing escapes to the transport.

use crate::local::Kite;
use crate::remote::RemoteKite;
use crate::request::{CallOptions, CallbackArg, Request};
use crate::transport::{Argument, ArgumentError, Arguments, Connection};
use futures::future::BoxFuture;
use futures::FutureExt;
use kite_types::KiteError;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Failure returned by a method handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Delivered to the caller unchanged.
    #[error(transparent)]
    Kite(#[from] KiteError),
    #[error(transparent)]
    Argument(#[from] ArgumentError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type HandlerResult = Result<Value, HandlerError>;

/// Handler for callbacks created with [`RemoteKite::callback`].
pub type CallbackFunc =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

impl HandlerError {
    pub fn into_kite_error(self) -> KiteError {
        match self {
            HandlerError::Kite(err) => err,
            HandlerError::Argument(err) => KiteError::argument(err.to_string()),
            HandlerError::Message(message) => KiteError::generic(message),
            HandlerError::Other(err) => match err.downcast::<KiteError>() {
                Ok(err) => err,
                Err(err) => match err.downcast::<ArgumentError>() {
                    Ok(err) => KiteError::argument(err.to_string()),
                    Err(err) => KiteError::generic(err.to_string()),
                },
            },
        }
    }
}

impl From<HandlerError> for KiteError {
    fn from(err: HandlerError) -> Self {
        err.into_kite_error()
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Message(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Message(message.to_string())
    }
}

/// Serialization inside a handler, typically of its result. Argument
/// decoding goes through [`Arguments::unmarshal`] and reports
/// [`ArgumentError`] instead.
impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Other(err.into())
    }
}

/// Convert a panic payload raised inside a handler.
pub(crate) fn recover_panic(payload: Box<dyn Any + Send>) -> KiteError {
    let payload = match payload.downcast::<KiteError>() {
        Ok(err) => return *err,
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<ArgumentError>() {
        Ok(err) => return KiteError::argument(err.to_string()),
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<anyhow::Error>() {
        Ok(err) => return HandlerError::Other(*err).into_kite_error(),
        Err(payload) => payload,
    };
    if let Some(message) = payload.downcast_ref::<String>() {
        return KiteError::generic(message.clone());
    }
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        return KiteError::generic(*message);
    }
    KiteError::generic("handler panicked")
}

impl Kite {
    /// Dispatch one inbound method call arriving on `conn`.
    pub async fn run_method(
        self: Arc<Self>,
        method: String,
        args: Arguments,
        conn: Arc<dyn Connection>,
    ) {
        let callback = CallOptions::response_callback_of(&args);

        let outcome = AssertUnwindSafe(self.invoke_handler(&method, args, &conn))
            .catch_unwind()
            .await;
        let (result, err) = match outcome {
            Ok(Ok(result)) => (result, None),
            Ok(Err(err)) => (Value::Null, Some(err)),
            Err(payload) => (Value::Null, Some(recover_panic(payload))),
        };
        if let Some(err) = &err {
            warn!(method = %method, error = %err, "Error in received message");
        }

        let Some(callback) = callback else {
            debug!(method = %method, "No response callback, discarding result");
            return;
        };
        let response = CallbackArg { error: err, result };
        let response = match Argument::value(&response) {
            Ok(response) => response,
            Err(e) => {
                error!(method = %method, error = %e, "Cannot encode response");
                return;
            }
        };
        if let Err(e) = callback.invoke(Arguments::single(response)).await {
            error!(method = %method, error = %e, "Cannot deliver response");
        }
    }

    async fn invoke_handler(
        self: &Arc<Self>,
        method: &str,
        args: Arguments,
        conn: &Arc<dyn Connection>,
    ) -> Result<Value, KiteError> {
        let handler = self
            .handler(method)
            .ok_or_else(|| KiteError::method_not_found(method))?;

        let mut request = self
            .parse_request(method, &args, conn)
            .map_err(|e| KiteError::argument(e.to_string()))?;

        if self.authentication_enabled() {
            request.authenticate()?;
        }

        handler(request).await.map_err(HandlerError::into_kite_error)
    }

    /// Decode the envelope and resolve the caller, creating and announcing
    /// it on the first call over `conn`.
    fn parse_request(
        self: &Arc<Self>,
        method: &str,
        args: &Arguments,
        conn: &Arc<dyn Connection>,
    ) -> Result<Request, ArgumentError> {
        let options = CallOptions::decode(args)?;
        let remote = self.resolve_remote(&options, conn);

        Ok(Request {
            method: method.to_string(),
            args: options.with_args,
            local_kite: self.clone(),
            remote_kite: remote,
            username: options.kite.username,
            authentication: options.authentication,
            remote_addr: conn.remote_addr(),
        })
    }

    /// The peer cached on `conn`, created and announced on first use.
    fn resolve_remote(
        self: &Arc<Self>,
        options: &CallOptions,
        conn: &Arc<dyn Connection>,
    ) -> Arc<RemoteKite> {
        let (remote, created) = conn.context().remote_kite_or_init(|| {
            RemoteKite::accepted(
                self.clone(),
                options.kite.clone(),
                options.authentication.clone(),
                conn,
            )
        });
        if created {
            self.notify_remote_kite_connected(&remote);
        } else {
            remote.set_identity(options.kite.clone());
        }
        remote
    }

    /// Run a callback created through `origin` and invoked by the peer on
    /// the other end of its connection. No authentication and no response;
    /// failures are only logged.
    pub(crate) async fn run_callback(
        self: Arc<Self>,
        handler: CallbackFunc,
        args: Arguments,
        origin: Arc<RemoteKite>,
    ) {
        let run = async {
            let options = CallOptions::decode(&args)?;
            let (remote, remote_addr) = match origin.connection() {
                Ok(conn) => (self.resolve_remote(&options, &conn), conn.remote_addr()),
                Err(e) => {
                    debug!(error = %e, "Callback invoked without a connection");
                    origin.set_identity(options.kite.clone());
                    (origin.clone(), String::new())
                }
            };
            let request = Request {
                method: String::new(),
                args: options.with_args,
                local_kite: self.clone(),
                remote_kite: remote,
                username: options.kite.username,
                authentication: options.authentication,
                remote_addr,
            };
            handler(request).await
        };

        let err = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.into_kite_error(),
            Err(payload) => recover_panic(payload),
        };
        warn!(remote = %origin.identity(), error = %err, "Error in callback");
    }
}
