//! Protocol constants shared by the three node roles.

/// Route liveness counter bands.
pub mod obsolescence {
    /// Fresh route.
    pub const ACTIVE: u8 = 0;

    /// A route reaching this many missed refreshes is withdrawn on the same tick.
    pub const STALE_LIMIT: u8 = 3;

    /// Incoming gossip may overwrite a local row only while the local row is below this.
    pub const MERGEABLE_BELOW: u8 = 3;

    /// Routes at or above this value are ignored by routing decisions.
    pub const SELECTABLE_BELOW: u8 = 13;

    /// Withdrawn (tombstone) band start. Heartbeats cannot revive a row from here.
    pub const WITHDRAWN: u8 = 14;

    /// Rows at this value are physically removed.
    pub const TERMINAL: u8 = 16;
}

/// Route pattern used when nothing else matches a target number.
pub const FALLBACK_PATTERN_PROBE: &str = "fallback";

/// Default application id for submissions that do not name one.
pub const DEFAULT_APP_ID: &str = "legacy";

/// Session close codes.
pub mod close_code {
    /// No usable modem: the modem node stops reconnecting.
    pub const FATAL: u16 = 4000;

    /// Primary dispatcher is reachable again: reconnect from the first URL.
    pub const PRIMARY_RECOVERED: u16 = 4001;

    /// Protocol mismatch or failed upstream registration.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Session status values written by the modem node.
pub mod delivery_result {
    pub const SENT: &str = "SENT";
    pub const SUCCESS: &str = "SUCCESS";
    pub const ERROR: &str = "ERROR";
}

/// Session protocol version spoken between dispatcher and modem node.
pub const SESSION_PROTOCOL_VERSION: &str = "2";

/// Single-segment SMS limits.
pub const SMS_SEGMENT_ASCII: usize = 160;
pub const SMS_SEGMENT_UNICODE: usize = 70;

pub mod defaults {
    pub const GOSSIP_INTERVAL_SECS: u64 = 25;
    pub const STALE_AFTER_SECS: i64 = 30;
    pub const PROBE_EVERY_TICKS: u32 = 5;
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
    pub const RETRY_URL: u32 = 2;
    pub const RETRY_WAIT_SECS: u64 = 5;
    pub const MAX_WAIT_SECS: u64 = 10;
    pub const RETENTION_SECS: i64 = 86_400;
    pub const HTTP_TIMEOUT_SECS: u64 = 5;
    pub const DELIVERY_TIMEOUT_SECS: u64 = 20;
    pub const PRIMARY_CHECK_SECS: i64 = 300;
}
