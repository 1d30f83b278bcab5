// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for a [`crate::ShareFs`] instance

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::fault::FaultPolicy;

/// Longest volume label, in UTF-16 code units.
pub const MAX_LABEL_UNITS: usize = 32;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsLimits {
    pub max_open_handles: usize,
}

impl Default for FsLimits {
    fn default() -> Self {
        Self {
            max_open_handles: 65_536,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub label: String,
    /// Reported total and free size in bytes.
    pub total_size: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            label: "sharefs".to_string(),
            total_size: 8 * 1024 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Idle lock slots kept for reuse; 0 disables pooling.
    pub slot_pool_capacity: usize,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            slot_pool_capacity: sharefs_pathlock::DEFAULT_POOL_CAPACITY,
        }
    }
}

/// Where file data lives
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackstoreMode {
    #[default]
    InMemory,
    HostFs {
        root: PathBuf,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub limits: FsLimits,
    pub volume: VolumeConfig,
    pub locking: LockingConfig,
    pub backstore: BackstoreMode,
    pub faults: FaultPolicy,
}

impl FsConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
