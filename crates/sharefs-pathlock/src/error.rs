// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Acquisition outcome types

/// A lock request conflicted with the current holders of a path.
///
/// This is an expected, recoverable outcome rather than a failure: callers
/// usually surface it as a sharing violation or poll again later.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("path is held by a conflicting lock")]
pub struct Busy;
