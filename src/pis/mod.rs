pub mod registry;
pub mod server;
pub mod upstream;

pub use registry::{DeliveryOutcome, SessionRegistry};
pub use server::Dispatcher;
pub use upstream::WisLink;
