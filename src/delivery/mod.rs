pub mod assign;
pub mod store;
pub mod watchdog;

pub use assign::{assign_route, select_route};
pub use store::{open_message_store, InMemoryMessageStore, MessageStore, SledMessageStore};
pub use watchdog::Watchdog;
