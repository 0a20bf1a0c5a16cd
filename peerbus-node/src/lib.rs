//! peerbus node: the async host around `peerbus-core`.
//!
//! Transports and endpoints move frames, discovery exchanges advertisements on the LAN, and
//! [`BusAttachment`] ties them to the session multiplexer.

pub mod bus;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod listener;
pub mod transport;

pub use bus::{BusAttachment, BusAttachmentBuilder, SessionMessage};
pub use config::{Config, ConfigError};
pub use listener::{BusListener, SessionListener, SessionPortListener};
pub use transport::{AutoAccept, BusAddress, ConnectionApproval};
