//! # Peer Connections
//!
//! ```text
//! manager.rs  ConnectionManager: per-peer sessions, fallback, reconnect
//! session.rs  Session: one handshaken channel and its in-flight requests
//! backoff.rs  Reconnect delay schedule
//! error.rs    ConnectionError
//! ```

pub mod backoff;
pub mod error;
pub mod manager;
pub mod session;

pub use backoff::Backoff;
pub use error::ConnectionError;
pub use manager::{ConnectionDeps, ConnectionManager};
pub use session::{Session, SessionInfo};
