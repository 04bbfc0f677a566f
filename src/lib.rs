//! A dynamically typed D-Bus implementation for Tokio.
//!
//! This crate speaks the D-Bus wire protocol directly and provides an
//! asynchronous [`MessageBus`] which multiplexes method calls, replies,
//! errors and signals between local handlers and remote peers. Local
//! objects are exported through [`ServiceInterface`], remote objects are
//! consumed through [`ProxyObject`].
//!
//! # Examples
//!
//! ```no_run
//! use tokio_dbus_next::{Message, MessageBus, Value};
//!
//! # #[tokio::main] async fn main() -> tokio_dbus_next::Result<()> {
//! let bus = MessageBus::session_bus()?;
//! bus.connect().await?;
//!
//! let reply = bus
//!     .call(
//!         Message::method_call("/org/freedesktop/DBus", "ListNames")?
//!             .with_destination("org.freedesktop.DBus")?
//!             .with_interface("org.freedesktop.DBus")?,
//!     )
//!     .await?;
//!
//! if let Some(reply) = reply {
//!     if let Some(Value::Array(names)) = reply.body().first() {
//!         println!("{} names on the bus", names.len());
//!     }
//! }
//! # Ok(()) }
//! ```

#[macro_use]
mod proto;
#[doc(inline)]
pub use self::proto::{Endianness, Flags, MessageType};

#[doc(inline)]
pub use self::error::{DBusError, Error, Result};
mod error;

pub mod validators;

#[doc(inline)]
pub use self::signature::{SignatureTree, SignatureType};
mod signature;

#[doc(inline)]
pub use self::value::{Value, Variant};
mod value;

mod marshal;

#[doc(inline)]
pub use self::unmarshal::{Progress, Unmarshaller};
mod unmarshal;

#[doc(inline)]
pub use self::message::{Message, MessageKind};
mod message;

#[doc(inline)]
pub use self::address::BusType;
pub mod address;

pub mod auth;

mod connection;

pub mod introspection;

#[doc(inline)]
pub use self::service::ServiceInterface;
pub mod service;

#[doc(inline)]
pub use self::proxy::{ProxyInterface, ProxyObject};
mod proxy;

#[doc(inline)]
pub use self::bus::{
    HandlerId, HandlerResult, MatchRule, MessageBus, MessageHandler, SignalHandler,
    SubscriptionId,
};
mod bus;

pub mod org_freedesktop_dbus;

mod utils;
