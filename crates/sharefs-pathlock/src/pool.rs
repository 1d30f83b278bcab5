// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Freelist of slot counters shared by one lock table

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

pub(crate) type SlotCell = Arc<AtomicUsize>;

/// Default number of idle counters kept around for reuse.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Bounded pool of counter cells.
///
/// A cell is only taken back when the caller hands over the last reference to
/// it, so a recycled cell can never be observed through a stale clone that was
/// loaded under its previous path.
pub(crate) struct SlotPool {
    free: Option<ArrayQueue<SlotCell>>,
}

impl SlotPool {
    /// A capacity of zero disables pooling entirely.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            free: (capacity > 0).then(|| ArrayQueue::new(capacity)),
        }
    }

    pub(crate) fn take(&self, initial: usize) -> SlotCell {
        match self.free.as_ref().and_then(ArrayQueue::pop) {
            Some(cell) => {
                cell.store(initial, Ordering::Release);
                cell
            }
            None => Arc::new(AtomicUsize::new(initial)),
        }
    }

    pub(crate) fn recycle(&self, mut cell: SlotCell) {
        let Some(free) = &self.free else {
            return;
        };
        if Arc::get_mut(&mut cell).is_some() {
            // A full pool just lets the cell drop.
            let _ = free.push(cell);
        }
    }

    pub(crate) fn idle(&self) -> usize {
        self.free.as_ref().map_or(0, ArrayQueue::len)
    }
}
