//! Client-side synchronization layer for the LAN chat client.
//!
//! The same reconcilers run against either the native host bridge or the
//! HTTP server; [`transport::Facade`] hides which one answers.

pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod models;
pub mod poller;
pub mod presence;
pub mod session;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transfer;
pub mod transport;
pub mod updates;
pub mod utils;

pub use config::{AcceptPolicy, SyncConfig, TransportKind};
pub use error::{SyncError, SyncResult};
pub use session::Session;
pub use transport::Facade;
pub use updates::SyncUpdate;
