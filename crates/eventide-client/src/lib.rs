#![warn(missing_docs)]

//! Eventide client engine: binary TCP protocol client for EventStore-style
//! servers. Operation scheduler, gossip cluster discovery, and volatile,
//! catch-up, and persistent subscriptions.

pub mod catchup;
pub mod connection;
pub mod discovery;
pub mod error;
mod heartbeat;
pub mod messages;
pub mod node;
mod operation;
mod operations;
pub mod persistent;
mod scheduler;
pub mod settings;
pub mod subscription;
mod transport;

pub use connection::Connection;
pub use error::{ClientError, Result};
pub use eventide_wire::{Credentials, Package, TcpCommand};
pub use settings::{
    ClusterSettings, ConnectionSettings, DiscoveryTarget, NodePreference, TlsSettings,
};
pub use subscription::SubscriptionDropReason;
