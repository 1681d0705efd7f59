//! # Routing
//!
//! ```text
//! scorer.rs    RouteScorer: moving-average peer quality
//! resolver.rs  LocalResolver and the bundled DataIndex
//! proxy.rs     ProxyRouter: local answer or ranked forwarding
//! error.rs     RouteError and its coarse classification
//! ```

pub mod error;
pub mod proxy;
pub mod resolver;
pub mod scorer;

pub use error::{RouteError, RouteFailure};
pub use proxy::{Forwarder, ProxyResponse, ProxyRouter, ServedBy};
pub use resolver::{DataIndex, IndexEntry, LocalResolver};
pub use scorer::{LatencyMapper, Outcome, RankedPeer, RouteScorer, SampleMapper};
