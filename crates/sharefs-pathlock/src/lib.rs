// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Non-blocking shared/exclusive locks over a path hierarchy for sharefs
//!
//! Readers, writers and access checkers of a path take shared locks; removers
//! and renamers take an exclusive lock. Every lock also holds shared locks on
//! all ancestors, so a directory can't be removed or renamed while anything
//! beneath it is in use. Acquisition never blocks: a conflict is reported as
//! [`Busy`] and leaves no state behind.
//!
//! Exclusive requests are not prioritised over a steady stream of shared ones
//! and may starve under continuous shared traffic.

pub mod error;
pub mod hierarchy;
pub mod path;
mod pool;
pub mod table;
pub mod token;

pub use error::Busy;
pub use hierarchy::{PathLock, PathLocker};
pub use path::NormalizedPath;
pub use pool::DEFAULT_POOL_CAPACITY;
pub use table::{LockTable, SlotState};
pub use token::{LockMode, LockToken};
