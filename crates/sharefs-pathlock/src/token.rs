// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Proof of a single-path acquisition

use std::fmt;
use std::sync::Arc;

use crate::path::NormalizedPath;
use crate::table::LockTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// One successful acquisition on one path.
///
/// The token is released exactly once: either explicitly through
/// [`LockToken::release`] (further calls are no-ops) or when it is dropped.
pub struct LockToken {
    table: Arc<LockTable>,
    path: NormalizedPath,
    mode: Option<LockMode>,
}

impl LockToken {
    pub(crate) fn new(table: Arc<LockTable>, path: NormalizedPath, mode: LockMode) -> Self {
        Self {
            table,
            path,
            mode: Some(mode),
        }
    }

    pub fn path(&self) -> &NormalizedPath {
        &self.path
    }

    /// Mode currently held, `None` after release.
    pub fn mode(&self) -> Option<LockMode> {
        self.mode
    }

    pub fn is_exclusive(&self) -> bool {
        self.mode == Some(LockMode::Exclusive)
    }

    pub fn is_released(&self) -> bool {
        self.mode.is_none()
    }

    /// Whether the token was issued by `table`.
    pub fn issued_by(&self, table: &LockTable) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.table), table)
    }

    /// Exclusive becomes shared in place; shared and released tokens are left alone.
    pub fn downgrade(&mut self) {
        if self.mode == Some(LockMode::Exclusive) {
            self.table.downgrade_exclusive(self.path.as_str());
            self.mode = Some(LockMode::Shared);
        }
    }

    pub fn release(&mut self) {
        let Some(mode) = self.mode.take() else {
            return;
        };
        if self.path.is_root() {
            return;
        }
        match mode {
            LockMode::Shared => self.table.unlock_shared(self.path.as_str()),
            LockMode::Exclusive => self.table.unlock_exclusive(self.path.as_str()),
        }
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockToken")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}
