#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod frame;
pub(crate) mod pending;
pub(crate) mod queue;
pub mod stats;
pub mod transport;

pub use crate::client::{Client, Delivery, SendOptions};
pub use crate::config::{ConnectionConfig, ReconnectConfig};
pub use crate::connection::ConnectionState;
pub use crate::error::{Error, Kind};
pub use crate::events::{Event, EventKind, ListenerId};
pub use crate::frame::{Frame, Priority};
pub use crate::stats::ConnectionStats;
pub use crate::transport::{Transport, TransportEvent, TransportHandle, WebSocketTransport};

pub type Result<T> = std::result::Result<T, Error>;
