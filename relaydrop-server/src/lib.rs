//! RelayDrop relay server library
//!
//! Exposes the relay's building blocks so the binary, the client's embedded
//! relay and integration tests share one implementation.

pub mod args;
pub mod config;
pub mod connection;
pub mod connection_tracker;
pub mod constants;
pub mod error;
pub mod registry;
pub mod server;
pub mod upnp;

pub use config::RelayConfig;
pub use connection_tracker::ConnectionTracker;
pub use error::{ProtocolError, RegistryError};
pub use registry::{SessionRegistry, SessionStatus, spawn_sweeper};
pub use server::serve;
