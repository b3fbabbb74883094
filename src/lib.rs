//! A hand-rolled, Tokio-based client implementation of the D-Bus wire
//! protocol: type system, binary codec, SASL authentication, connection
//! dispatch, signal routing, and bus-name tracking.
//!
//! This is a fairly low-level implementation: there is no code generation
//! from introspection XML, just [`Proxy`] as a thin, dynamically-typed
//! handle over a `(destination, path)` pair. See the crate-level
//! `README.md` for a full client example.

#[doc(inline)]
pub use self::error::{Error, ErrorKind, Result};
mod error;

#[doc(inline)]
pub use self::signature::{Signature, Type};
pub mod signature;

#[doc(inline)]
pub use self::object_path::ObjectPath;
mod object_path;

#[doc(inline)]
pub use self::value::{FromValue, ToValue, Value, Variant};
mod value;

mod endian;

pub(crate) mod codec;

#[doc(inline)]
pub use self::message::{Flags as MessageFlags, Message, MessageType};
mod message;

#[doc(inline)]
pub use self::transport::Transport;
mod transport;

mod sasl;

#[doc(inline)]
pub use self::signal::{MatchRule, SignalWatch};
mod signal;

#[doc(inline)]
pub use self::names::{BusName, NameFlags, NameReply, NameWatch};
mod names;

#[doc(inline)]
pub use self::bus::Bus;
mod bus;

#[doc(inline)]
pub use self::connection::{Connection, ConnectionBuilder, Filter, Handler};
mod connection;

#[doc(inline)]
pub use self::proxy::Proxy;
mod proxy;

#[doc(inline)]
pub use self::introspect::{Arg, Direction, Interface, Method, Node, Signal};
pub mod introspect;
