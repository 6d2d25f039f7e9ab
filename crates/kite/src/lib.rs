//! Kite service mesh runtime.
//!
//! Kites expose methods to each other over a bidirectional RPC transport,
//! authenticate every call, and find each other through the Kontrol
//! directory.
//!
//! ## Architecture
//!
//! - **Kite**: the local service. Owns the handler and authenticator
//!   registries and dispatches inbound calls.
//! - **RemoteKite**: one peer connection. Issues calls (`tell`) and creates
//!   callbacks the peer can invoke later.
//! - **Kontrol**: a RemoteKite for the directory, gated on its first
//!   successful connect. Registers, lists, watches and mints tokens.
//! - **Connection / Dialer**: the transport contract. The `memory` module
//!   provides an in-process implementation.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod kontrol;
pub mod local;
pub mod memory;
pub mod remote;
pub mod request;
pub mod transport;
pub mod watch;

pub use auth::AuthError;
pub use dispatch::{HandlerError, HandlerResult};
pub use error::{ClientError, ClientResult};
pub use kontrol::{Kontrol, ReadinessGate};
pub use local::Kite;
pub use memory::{MemoryConnection, MemoryNetwork};
pub use remote::RemoteKite;
pub use request::Request;
pub use transport::{
    Argument, ArgumentError, Arguments, Connection, ConnectionState, Dialer, Function,
    TransportError,
};
pub use watch::KiteWatcher;

pub use kite_types as types;
