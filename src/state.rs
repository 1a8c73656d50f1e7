use std::sync::atomic::{AtomicU8, Ordering};

/// Client-side view of a handle. The nodes stay the source of truth; a
/// `Locked` handle can still have lost its entries to TTL expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Acquiring,
    Locked,
    /// A release is running, or the last one was not confirmed by every node.
    Releasing,
}

impl LockState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LockState::Acquiring,
            2 => LockState::Locked,
            3 => LockState::Releasing,
            _ => LockState::Unlocked,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LockState::Unlocked => 0,
            LockState::Acquiring => 1,
            LockState::Locked => 2,
            LockState::Releasing => 3,
        }
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(LockState::Unlocked.as_u8()))
    }

    pub(crate) fn get(&self) -> LockState {
        LockState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: LockState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn swap(&self, state: LockState) -> LockState {
        LockState::from_u8(self.0.swap(state.as_u8(), Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_state() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), LockState::Unlocked);
        for s in [
            LockState::Acquiring,
            LockState::Locked,
            LockState::Releasing,
            LockState::Unlocked,
        ] {
            let before = cell.get();
            assert_eq!(cell.swap(s), before);
            assert_eq!(cell.get(), s);
        }
    }
}
