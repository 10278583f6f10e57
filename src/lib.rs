//! SMS gateway: submission nodes (WIS) that gossip a routing table and own
//! message delivery, dispatchers (PIS) that bridge delivery onto modem-node
//! sessions, and modem nodes (PID) that drive the actual modems.

pub mod codec;
pub mod config;
pub mod constants;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod pid;
pub mod pis;
pub mod routing;
pub mod shutdown;
pub mod transport;
pub mod types;
pub mod wire;
pub mod wis;

pub use codec::Codec;
pub use config::{Config, Role};
pub use error::AppError;
