//! tether-engine: the handshake and session engine.
//!
//! Sans-IO: nothing in this crate touches a socket, a device, or a clock.
//! Callers pass `now` and collect effects from an [`Outbox`].

pub mod connection_manager;
pub mod conntrack;
pub mod error;
pub mod firewall;
pub mod handshake;
pub mod hostmap;
pub mod interface;
pub mod outbox;
pub mod packet;
pub mod resolver;

pub use error::EngineError;
pub use hostmap::{HostInfo, HostMap, HostSnapshot};
pub use interface::{Interface, InterfaceStatus};
pub use outbox::{Outbox, Transmit};
pub use resolver::{AddressResolver, StaticHostMap};
