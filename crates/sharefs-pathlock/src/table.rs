// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path lock table: one atomic counter per locked path
//!
//! The counter of a slot encodes its state:
//!
//! | counter | state                                            |
//! |---------|--------------------------------------------------|
//! | 0       | exclusive, single writer                         |
//! | 1       | draining, last reader left and entry is removed  |
//! | n + 1   | shared by `n` readers                            |
//!
//! Entries are created with insert-if-absent and removed with
//! compare-and-delete on the map; every other transition is a CAS on the
//! counter itself, so no lock is ever held across a slot transition.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{trace, warn};

use crate::error::Busy;
use crate::path::NormalizedPath;
use crate::pool::{SlotCell, SlotPool, DEFAULT_POOL_CAPACITY};
use crate::token::{LockMode, LockToken};

const EXCLUSIVE: usize = 0;
const DRAINING: usize = 1;
const SHARED_ONE: usize = 2;

/// Observable state of a table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Exclusive,
    Shared(usize),
    Draining,
}

impl SlotState {
    fn from_counter(counter: usize) -> Self {
        match counter {
            EXCLUSIVE => SlotState::Exclusive,
            DRAINING => SlotState::Draining,
            n => SlotState::Shared(n - 1),
        }
    }
}

/// Concurrent map from normalized path to lock slot.
///
/// A table is an ordinary owned value; share it through an `Arc` (tokens keep
/// one) and create a fresh one wherever isolation is needed.
pub struct LockTable {
    slots: DashMap<NormalizedPath, SlotCell>,
    pool: SlotPool,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self::with_pool_capacity(DEFAULT_POOL_CAPACITY)
    }

    pub fn with_pool_capacity(capacity: usize) -> Self {
        Self {
            slots: DashMap::new(),
            pool: SlotPool::with_capacity(capacity),
        }
    }

    /// Take a shared lock on exactly `path` (no ancestors).
    ///
    /// The root is always readable and never occupies an entry.
    pub fn acquire_shared(self: &Arc<Self>, path: &NormalizedPath) -> Result<LockToken, Busy> {
        if !path.is_root() {
            self.lock_shared(path.as_str())?;
        }
        Ok(LockToken::new(Arc::clone(self), path.clone(), LockMode::Shared))
    }

    /// Take an exclusive lock on exactly `path` (no ancestors).
    ///
    /// The root can never be held exclusively.
    pub fn acquire_exclusive(self: &Arc<Self>, path: &NormalizedPath) -> Result<LockToken, Busy> {
        if path.is_root() {
            return Err(Busy);
        }
        self.lock_exclusive(path.as_str())?;
        Ok(LockToken::new(Arc::clone(self), path.clone(), LockMode::Exclusive))
    }

    /// Release a token. Releasing an already released token does nothing.
    ///
    /// The token must have been issued by this table.
    pub fn release(&self, token: &mut LockToken) {
        debug_assert!(token.issued_by(self), "token released through a foreign table");
        token.release();
    }

    /// Turn an exclusive token into a shared one without leaving the path unprotected.
    ///
    /// The token must have been issued by this table.
    pub fn downgrade(&self, token: &mut LockToken) {
        debug_assert!(token.issued_by(self), "token downgraded through a foreign table");
        token.downgrade();
    }

    pub(crate) fn lock_shared(&self, key: &str) -> Result<(), Busy> {
        loop {
            let cell = match self.slots.entry(NormalizedPath::from_clean(key)) {
                Entry::Vacant(vacant) => {
                    vacant.insert(self.pool.take(SHARED_ONE));
                    return Ok(());
                }
                Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            };

            let mut current = cell.load(Ordering::Acquire);
            loop {
                match current {
                    EXCLUSIVE => return Err(Busy),
                    // The thread that drained the entry is removing it; once it is
                    // gone a fresh entry can be inserted.
                    DRAINING => break,
                    n => {
                        let Some(next) = n.checked_add(1) else {
                            trace!(path = key, "shared count saturated");
                            return Err(Busy);
                        };
                        match cell.compare_exchange_weak(
                            n,
                            next,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => return Ok(()),
                            Err(actual) => current = actual,
                        }
                    }
                }
            }
            thread::yield_now();
        }
    }

    pub(crate) fn lock_exclusive(&self, key: &str) -> Result<(), Busy> {
        loop {
            let cell = match self.slots.entry(NormalizedPath::from_clean(key)) {
                Entry::Vacant(vacant) => {
                    vacant.insert(self.pool.take(EXCLUSIVE));
                    return Ok(());
                }
                Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            };
            if cell.load(Ordering::Acquire) != DRAINING {
                return Err(Busy);
            }
            thread::yield_now();
        }
    }

    pub(crate) fn unlock_shared(&self, key: &str) {
        let Some(cell) = self.slots.get(key).map(|slot| Arc::clone(slot.value())) else {
            warn!(path = key, "shared release of a path with no lock entry");
            return;
        };
        let previous = cell.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous >= SHARED_ONE, "shared release on counter {previous}");
        if previous == SHARED_ONE {
            // We own the draining entry; nobody else may remove it.
            let removed = self.slots.remove_if(key, |_, slot| Arc::ptr_eq(slot, &cell));
            drop(cell);
            if let Some((_, cell)) = removed {
                self.pool.recycle(cell);
            }
        }
    }

    pub(crate) fn unlock_exclusive(&self, key: &str) {
        match self.slots.remove(key) {
            Some((_, cell)) => {
                debug_assert_eq!(cell.load(Ordering::Acquire), EXCLUSIVE);
                self.pool.recycle(cell);
            }
            None => warn!(path = key, "exclusive release of a path with no lock entry"),
        }
    }

    pub(crate) fn downgrade_exclusive(&self, key: &str) {
        match self.slots.get(key) {
            Some(slot) => {
                let previous = slot.value().swap(SHARED_ONE, Ordering::AcqRel);
                debug_assert_eq!(previous, EXCLUSIVE, "downgrade of a non-exclusive slot");
            }
            None => warn!(path = key, "downgrade of a path with no lock entry"),
        }
    }

    /// Current state of `path`, or `None` when it is not locked.
    pub fn state_of(&self, path: &NormalizedPath) -> Option<SlotState> {
        self.slots
            .get(path.as_str())
            .map(|slot| SlotState::from_counter(slot.value().load(Ordering::Acquire)))
    }

    /// All live entries, sorted by path.
    pub fn snapshot(&self) -> Vec<(NormalizedPath, SlotState)> {
        let mut entries: Vec<_> = self
            .slots
            .iter()
            .map(|slot| {
                let state = SlotState::from_counter(slot.value().load(Ordering::Acquire));
                (slot.key().clone(), state)
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Counter cells currently parked in the freelist.
    pub fn pooled_slots(&self) -> usize {
        self.pool.idle()
    }
}

// Tokens keep the table alive, so entries that survive until here belong to
// tokens that were forgotten instead of released.
#[cfg(debug_assertions)]
impl Drop for LockTable {
    fn drop(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        for (path, state) in self.snapshot() {
            warn!(%path, ?state, "lock table dropped with a leaked entry");
        }
    }
}
