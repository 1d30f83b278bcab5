// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection policy and runtime controller for storage backends

use std::io;

use libc::EIO;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::FsError;

/// Backend operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    Open,
    Stat,
    Mkdir,
    Rename,
    Remove,
    Read,
    Write,
    Truncate,
    Sync,
    Readdir,
}

/// Supported errno values for synthetic failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultErrno {
    Eio,
    Enospc,
    Eacces,
}

impl FaultErrno {
    fn to_error(self) -> FsError {
        match self {
            FaultErrno::Eio => FsError::Io(io::Error::from_raw_os_error(EIO)),
            FaultErrno::Enospc => FsError::NoSpace,
            FaultErrno::Eacces => FsError::AccessDenied,
        }
    }
}

/// Which op should fail and how often.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    pub errno: FaultErrno,
    /// Leading invocations to let through before injecting.
    #[serde(default)]
    pub start_after: u64,
    #[serde(default)]
    pub max_faults: Option<u64>,
    /// Only fail calls whose path starts with this prefix.
    #[serde(default)]
    pub path_prefix: Option<String>,
}

impl Default for FaultRule {
    fn default() -> Self {
        Self {
            op: FaultOp::Write,
            errno: FaultErrno::Eio,
            start_after: 0,
            max_faults: None,
            path_prefix: None,
        }
    }
}

/// JSON-serializable fault policy
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Clone, Debug, Default)]
struct RuleCounters {
    hits: u64,
    invocations: u64,
}

#[derive(Clone, Debug, Default)]
struct FaultState {
    policy: FaultPolicy,
    counters: Vec<RuleCounters>,
}

/// Runtime controller that tracks policy and hit counts.
#[derive(Default)]
pub struct FaultInjector {
    state: Mutex<FaultState>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: FaultPolicy) -> Self {
        let injector = Self::new();
        injector.set_policy(policy);
        injector
    }

    pub fn set_policy(&self, policy: FaultPolicy) {
        let mut guard = self.state.lock();
        guard.counters = vec![RuleCounters::default(); policy.rules.len()];
        guard.policy = policy;
    }

    pub fn clear(&self) {
        self.set_policy(FaultPolicy::default());
    }

    /// Total faults injected so far across all rules.
    pub fn injected(&self) -> u64 {
        self.state.lock().counters.iter().map(|c| c.hits).sum()
    }

    pub fn should_fault(&self, op: FaultOp, path: &str) -> Option<FsError> {
        let mut guard = self.state.lock();
        if !guard.policy.enabled {
            return None;
        }
        let FaultState { policy, counters } = &mut *guard;
        counters.resize(policy.rules.len(), RuleCounters::default());
        for (rule, counters) in policy.rules.iter().zip(counters.iter_mut()) {
            if rule.op != op {
                continue;
            }
            if let Some(prefix) = &rule.path_prefix {
                if !path.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            counters.invocations = counters.invocations.saturating_add(1);
            if counters.invocations <= rule.start_after {
                continue;
            }
            if let Some(max) = rule.max_faults {
                if counters.hits >= max {
                    continue;
                }
            }
            counters.hits = counters.hits.saturating_add(1);
            tracing::debug!(?op, path, errno = ?rule.errno, "injecting backend fault");
            return Some(rule.errno.to_error());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fault_policy_json() {
        let json = br#"{ "enabled": true, "rules": [ { "op": "rename", "errno": "eio", "max_faults": 2 } ] }"#;
        let policy = FaultPolicy::from_json_bytes(json).expect("policy");
        assert!(policy.enabled);
        assert_eq!(policy.rules.len(), 1);
        assert_eq!(policy.rules[0].op, FaultOp::Rename);
        assert_eq!(policy.rules[0].max_faults, Some(2));
    }

    #[test]
    fn injector_respects_start_and_max_hits() {
        let injector = FaultInjector::with_policy(FaultPolicy {
            enabled: true,
            rules: vec![FaultRule {
                op: FaultOp::Write,
                errno: FaultErrno::Eio,
                start_after: 1,
                max_faults: Some(2),
                path_prefix: None,
            }],
        });

        // First call skipped due to start_after
        assert!(injector.should_fault(FaultOp::Write, "/f").is_none());
        assert!(injector.should_fault(FaultOp::Write, "/f").is_some());
        assert!(injector.should_fault(FaultOp::Write, "/f").is_some());
        // Max hits reached
        assert!(injector.should_fault(FaultOp::Write, "/f").is_none());
        assert_eq!(injector.injected(), 2);
    }

    #[test]
    fn path_prefix_limits_rule() {
        let injector = FaultInjector::with_policy(FaultPolicy {
            enabled: true,
            rules: vec![FaultRule {
                op: FaultOp::Remove,
                errno: FaultErrno::Eacces,
                path_prefix: Some("/locked".to_string()),
                ..FaultRule::default()
            }],
        });
        assert!(injector.should_fault(FaultOp::Remove, "/other").is_none());
        assert!(matches!(
            injector.should_fault(FaultOp::Remove, "/locked/file"),
            Some(FsError::AccessDenied)
        ));
        injector.clear();
        assert!(injector.should_fault(FaultOp::Remove, "/locked/file").is_none());
    }
}
