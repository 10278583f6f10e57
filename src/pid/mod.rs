pub mod client;
pub mod failover;
pub mod heartbeat;
pub mod modem;

pub use client::{ModemNodeClient, SessionEnd};
pub use failover::FailoverCursor;
pub use modem::{GammuModem, Modem, ModemBank, TestModem};
