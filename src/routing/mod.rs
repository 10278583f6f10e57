//! Gossiped, self-expiring routing table.

pub mod obsolescence;
pub mod protocol;
pub mod store;

pub use obsolescence::Liveness;
pub use protocol::RoutingProtocol;
pub use store::{MergeOutcome, RouteStore};
