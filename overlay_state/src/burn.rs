//! Resource meters charged by every storage access.

use std::{cell::Cell, fmt::Debug};

use crate::storage::{StorageError, StorageResult};

/// A caller-supplied resource meter.
pub trait Burner: Debug {
    /// Charges `amount`, failing with [`StorageError::ResourceExhausted`] if
    /// the meter cannot cover it.
    fn burn(&self, amount: u64) -> StorageResult<()>;

    /// Total amount charged so far.
    fn burned(&self) -> u64;
}

/// Meter used by the protocol itself: never runs out, only counts.
#[derive(Debug, Default)]
pub struct SystemBurner {
    burned: Cell<u64>,
}

impl SystemBurner {
    /// Creates a meter with nothing charged yet.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Burner for SystemBurner {
    fn burn(&self, amount: u64) -> StorageResult<()> {
        self.burned.set(self.burned.get().saturating_add(amount));
        Ok(())
    }

    fn burned(&self) -> u64 {
        self.burned.get()
    }
}

/// Meter with a hard limit, used when a user transaction pays for overlay
/// work.
#[derive(Debug)]
pub struct GasMeter {
    limit: u64,
    burned: Cell<u64>,
}

impl GasMeter {
    /// Creates a meter allowing up to `limit` units.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            burned: Cell::new(0),
        }
    }

    /// Units still available.
    pub fn remaining(&self) -> u64 {
        self.limit - self.burned.get()
    }
}

impl Burner for GasMeter {
    fn burn(&self, amount: u64) -> StorageResult<()> {
        let available = self.remaining();
        if amount > available {
            // A failed charge depletes the meter.
            self.burned.set(self.limit);
            return Err(StorageError::ResourceExhausted {
                needed: amount,
                available,
            });
        }
        self.burned.set(self.burned.get() + amount);
        Ok(())
    }

    fn burned(&self) -> u64 {
        self.burned.get()
    }
}
