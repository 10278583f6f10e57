//! Route liveness as an explicit state machine.
//!
//! The numeric counter carried in gossip maps onto three states:
//! `0` is [`Liveness::Active`], `1..=13` is [`Liveness::Stale`] and
//! `14..=16` is [`Liveness::Withdrawn`]. All transitions are pure so they
//! can be exercised without timers.

use crate::constants::obsolescence::{ACTIVE, STALE_LIMIT, TERMINAL, WITHDRAWN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Stale(u8),
    Withdrawn(u8),
}

impl Liveness {
    pub fn from_counter(value: u8) -> Self {
        match value {
            ACTIVE => Liveness::Active,
            v if v < WITHDRAWN => Liveness::Stale(v),
            v => Liveness::Withdrawn(v.min(TERMINAL)),
        }
    }

    pub fn counter(self) -> u8 {
        match self {
            Liveness::Active => ACTIVE,
            Liveness::Stale(n) | Liveness::Withdrawn(n) => n,
        }
    }

    /// One protocol tick. `stale` tells whether the row missed its refresh
    /// window; withdrawn rows advance regardless.
    pub fn tick(self, stale: bool) -> Self {
        match self {
            Liveness::Withdrawn(n) => Liveness::Withdrawn((n + 1).min(TERMINAL)),
            live if !stale => live,
            live => {
                let next = live.counter() + 1;
                if next == STALE_LIMIT || next >= WITHDRAWN {
                    Liveness::Withdrawn(WITHDRAWN)
                } else {
                    Liveness::Stale(next)
                }
            }
        }
    }

    /// Heartbeat refresh. Withdrawn rows stay withdrawn.
    pub fn refresh(self) -> Self {
        match self {
            Liveness::Withdrawn(_) => self,
            _ => Liveness::Active,
        }
    }

    /// Explicit withdrawal (unregistration, failed probe).
    pub fn withdraw(self) -> Self {
        match self {
            Liveness::Withdrawn(_) => self,
            _ => Liveness::Withdrawn(WITHDRAWN),
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Liveness::Withdrawn(TERMINAL)
    }
}
