//! Connection lifecycle state.

use std::sync::atomic::{AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    New = 0,
    Opening = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Opening,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            4 => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// Thin `AtomicU8` wrapper enforcing the total order
/// `New < Opening < Open < Closing < Closed` via compare-and-swap only.
pub struct ConnectionStateCell(AtomicU8);

impl ConnectionStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::New as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Forces a move straight to `Closed` from whatever state is current,
    /// short of `Closed` itself. Returns `false` if already `Closed` (so
    /// callers can treat shutdown as idempotent).
    pub fn force_closed(&self) -> bool {
        loop {
            let current = self.0.load(Ordering::Acquire);
            if current == ConnectionState::Closed as u8 {
                return false;
            }
            if self
                .0
                .compare_exchange(current, ConnectionState::Closed as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_total_order() {
        let cell = ConnectionStateCell::new();
        assert!(cell.transition(ConnectionState::New, ConnectionState::Opening));
        assert!(!cell.transition(ConnectionState::New, ConnectionState::Opening));
        assert!(cell.transition(ConnectionState::Opening, ConnectionState::Open));
        assert_eq!(cell.get(), ConnectionState::Open);
    }

    #[test]
    fn force_closed_is_idempotent() {
        let cell = ConnectionStateCell::new();
        assert!(cell.force_closed());
        assert!(!cell.force_closed());
        assert_eq!(cell.get(), ConnectionState::Closed);
    }
}
