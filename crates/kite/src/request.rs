//! Inbound call request and the call envelope.
//!
//! Every call carries a single structured argument:
//!
//! ```json
//! {"kite": {...}, "authentication": {"type": "...", "key": "..."},
//!  "withArgs": [...], "responseCallback": [Function]}
//! ```
//!
//! The response callback, when present, is invoked once with
//! `{"error": null | {...}, "result": ...}`.

use crate::local::Kite;
use crate::remote::RemoteKite;
use crate::transport::{Argument, ArgumentError, Arguments, Function};
use kite_types::{Authentication, KiteError, KiteIdentity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

const KITE: &str = "kite";
const AUTHENTICATION: &str = "authentication";
const WITH_ARGS: &str = "withArgs";
const RESPONSE_CALLBACK: &str = "responseCallback";

/// One inbound call, as seen by authenticators and handlers.
pub struct Request {
    pub method: String,
    /// The caller's `withArgs`.
    pub args: Arguments,
    pub local_kite: Arc<Kite>,
    /// The caller. Cached per connection.
    pub remote_kite: Arc<RemoteKite>,
    /// Caller's username. Authenticators overwrite it with the verified one.
    pub username: String,
    pub authentication: Option<Authentication>,
    /// Empty when the call arrived on a connection this kite dialed.
    pub remote_addr: String,
}

/// Decoded call envelope.
pub(crate) struct CallOptions {
    pub kite: KiteIdentity,
    pub authentication: Option<Authentication>,
    pub with_args: Arguments,
    pub response_callback: Option<Function>,
}

impl CallOptions {
    pub fn decode(args: &Arguments) -> Result<Self, ArgumentError> {
        let options = args.one()?;
        let kite = options
            .field(KITE)?
            .ok_or_else(|| ArgumentError::MissingField(KITE.to_string()))?
            .unmarshal()?;
        let authentication = options
            .field(AUTHENTICATION)?
            .map(|auth| auth.unmarshal())
            .transpose()?;
        let with_args = match options.field(WITH_ARGS)? {
            Some(list) => Arguments::new(list.into_list()?),
            None => Arguments::default(),
        };
        let response_callback = options
            .field(RESPONSE_CALLBACK)?
            .map(|f| f.function())
            .transpose()?;
        Ok(Self {
            kite,
            authentication,
            with_args,
            response_callback,
        })
    }

    /// Pull the response callback out of a possibly malformed envelope.
    pub fn response_callback_of(args: &Arguments) -> Option<Function> {
        args.get(0)?
            .field(RESPONSE_CALLBACK)
            .ok()??
            .function()
            .ok()
    }

    pub fn encode(self) -> Result<Argument, ArgumentError> {
        let mut fields = BTreeMap::new();
        fields.insert(KITE.to_string(), Argument::value(&self.kite)?);
        if let Some(auth) = &self.authentication {
            fields.insert(AUTHENTICATION.to_string(), Argument::value(auth)?);
        }
        fields.insert(
            WITH_ARGS.to_string(),
            Argument::List(self.with_args.into_vec()),
        );
        if let Some(callback) = self.response_callback {
            fields.insert(RESPONSE_CALLBACK.to_string(), Argument::Function(callback));
        }
        Ok(Argument::Map(fields))
    }
}

/// The only argument passed to a response callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CallbackArg {
    #[serde(default)]
    pub error: Option<KiteError>,
    #[serde(default)]
    pub result: Value,
}
