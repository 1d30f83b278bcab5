// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Hierarchical locking over a [`LockTable`]
//!
//! Reading a path takes shared locks on every ancestor from the top down and on
//! the path itself. Writing a path takes the same shared ancestor chain and an
//! exclusive lock on the path. Because every chain is taken in the same
//! top-down order, two acquisitions over overlapping paths can never wait on
//! each other in a cycle; and because acquisition never blocks, a conflict
//! anywhere unwinds whatever was already taken and reports [`Busy`].

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::error::Busy;
use crate::path::NormalizedPath;
use crate::table::LockTable;
use crate::token::{LockMode, LockToken};

/// Entry point for hierarchical acquisitions. Clones share the same table.
#[derive(Clone, Default)]
pub struct PathLocker {
    table: Arc<LockTable>,
}

impl PathLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: Arc<LockTable>) -> Self {
        Self { table }
    }

    pub fn with_pool_capacity(capacity: usize) -> Self {
        Self::with_table(Arc::new(LockTable::with_pool_capacity(capacity)))
    }

    pub fn table(&self) -> &Arc<LockTable> {
        &self.table
    }

    /// Read-lock a slash-separated path.
    pub fn lock_for_read(&self, path: &str) -> Result<PathLock, Busy> {
        self.read_normalized(&NormalizedPath::new(path))
    }

    /// Write-lock a slash-separated path.
    pub fn lock_for_write(&self, path: &str) -> Result<PathLock, Busy> {
        self.write_normalized(&NormalizedPath::new(path))
    }

    /// Read-lock a native Windows path.
    pub fn lock_native_for_read(&self, path: &str) -> Result<PathLock, Busy> {
        self.read_normalized(&NormalizedPath::from_native(path))
    }

    /// Write-lock a native Windows path.
    pub fn lock_native_for_write(&self, path: &str) -> Result<PathLock, Busy> {
        self.write_normalized(&NormalizedPath::from_native(path))
    }

    pub fn read_normalized(&self, path: &NormalizedPath) -> Result<PathLock, Busy> {
        let chain = self.shared_chain(path.ancestors(), path.depth())?;
        Ok(PathLock::new(path.clone(), chain))
    }

    pub fn write_normalized(&self, path: &NormalizedPath) -> Result<PathLock, Busy> {
        if path.is_root() {
            trace!("write lock on the root refused");
            return Err(Busy);
        }
        let depth = path.depth();
        let mut chain = self.shared_chain(path.ancestors().take(depth - 1), depth)?;
        match self.table.lock_exclusive(path.as_str()) {
            Ok(()) => {
                chain.push(LockToken::new(
                    Arc::clone(&self.table),
                    path.clone(),
                    LockMode::Exclusive,
                ));
                Ok(PathLock::new(path.clone(), chain))
            }
            Err(busy) => {
                trace!(%path, "exclusive lock busy");
                unwind(&mut chain);
                Err(busy)
            }
        }
    }

    fn shared_chain<'a>(
        &self,
        prefixes: impl Iterator<Item = &'a str>,
        capacity: usize,
    ) -> Result<Vec<LockToken>, Busy> {
        let mut chain = Vec::with_capacity(capacity);
        for prefix in prefixes {
            if let Err(busy) = self.table.lock_shared(prefix) {
                trace!(path = prefix, "shared lock busy");
                unwind(&mut chain);
                return Err(busy);
            }
            chain.push(LockToken::new(
                Arc::clone(&self.table),
                NormalizedPath::from_clean(prefix),
                LockMode::Shared,
            ));
        }
        Ok(chain)
    }
}

/// Release a chain leaf-first.
fn unwind(chain: &mut Vec<LockToken>) {
    while let Some(mut token) = chain.pop() {
        token.release();
    }
}

/// A held hierarchical lock: the ancestor tokens plus the leaf token, top-down.
///
/// The chain is opaque so it can only be released as a whole and in the right
/// order. [`PathLock::unlock`] may be called any number of times; dropping the
/// lock unlocks it as well.
pub struct PathLock {
    path: NormalizedPath,
    chain: Vec<LockToken>,
    released: bool,
}

impl PathLock {
    fn new(path: NormalizedPath, chain: Vec<LockToken>) -> Self {
        Self {
            path,
            chain,
            released: false,
        }
    }

    pub fn path(&self) -> &NormalizedPath {
        &self.path
    }

    /// Mode held on the path itself. The root is always held shared.
    pub fn mode(&self) -> LockMode {
        match self.chain.last() {
            Some(leaf) if leaf.path() == &self.path && leaf.is_exclusive() => LockMode::Exclusive,
            _ => LockMode::Shared,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        !self.released && self.mode() == LockMode::Exclusive
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Exclusive becomes shared on the leaf; ancestors are untouched.
    pub fn downgrade(&mut self) {
        if let Some(leaf) = self.chain.last_mut() {
            leaf.downgrade();
        }
    }

    pub fn unlock(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        unwind(&mut self.chain);
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

impl fmt::Debug for PathLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathLock")
            .field("path", &self.path)
            .field("mode", &self.mode())
            .field("released", &self.released)
            .finish()
    }
}
