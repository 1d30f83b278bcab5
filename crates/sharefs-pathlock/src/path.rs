// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Canonical slash-separated paths used as lock-table keys

use std::borrow::Borrow;
use std::fmt;

/// A cleaned, absolute, slash-separated path.
///
/// `.` and `..` are resolved lexically (`..` above the root stays at the root),
/// repeated separators collapse, and there is never a trailing slash except for
/// the root itself. Every spelling of the same location yields the same value,
/// which is what makes it usable as a lock key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedPath(String);

impl NormalizedPath {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Normalize a slash-separated path. Relative inputs are taken relative to the root.
    pub fn new(path: &str) -> Self {
        Self::clean(path.split('/'))
    }

    /// Normalize a native Windows path: the volume prefix is dropped and both
    /// `\` and `/` are accepted as separators.
    pub fn from_native(path: &str) -> Self {
        let rest = &path[volume_name_len(path)..];
        Self::clean(rest.split(['/', '\\']))
    }

    fn clean<'a>(components: impl Iterator<Item = &'a str>) -> Self {
        let mut parts: Vec<&str> = Vec::new();
        for component in components {
            match component {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                name => parts.push(name),
            }
        }
        if parts.is_empty() {
            return Self::root();
        }
        let mut out = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
        for part in parts {
            out.push('/');
            out.push_str(part);
        }
        Self(out)
    }

    /// Wrap a string that is already known to be clean (e.g. a prefix of a
    /// normalized path).
    pub(crate) fn from_clean(path: &str) -> Self {
        debug_assert!(path.starts_with('/'));
        Self(path.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Parent directory, or `None` for the root.
    pub fn parent(&self) -> Option<NormalizedPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
        }
    }

    /// Last component, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    pub fn join(&self, name: &str) -> NormalizedPath {
        Self::new(&format!("{}/{}", self.0, name))
    }

    /// Number of components below the root.
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.matches('/').count()
        }
    }

    /// Every non-root prefix from the top down, ending with the path itself.
    ///
    /// For `/a/b/c` this yields `/a`, `/a/b`, `/a/b/c`; for the root it yields nothing.
    pub fn ancestors(&self) -> impl Iterator<Item = &str> + '_ {
        let path = self.0.as_str();
        let ends = path
            .char_indices()
            .skip(1)
            .filter(|(_, c)| *c == '/')
            .map(|(idx, _)| idx)
            .chain((!self.is_root()).then_some(path.len()));
        ends.map(move |end| &path[..end])
    }

    /// True when `self` is `other` or lies below it.
    pub fn starts_with(&self, other: &NormalizedPath) -> bool {
        if other.is_root() {
            return true;
        }
        match self.0.strip_prefix(other.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Length of the leading volume name: `C:` or `\\server\share`.
fn volume_name_len(path: &str) -> usize {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return 2;
    }
    let is_sep = |b: u8| b == b'\\' || b == b'/';
    if bytes.len() >= 3 && is_sep(bytes[0]) && is_sep(bytes[1]) && !is_sep(bytes[2]) {
        let server_end = match bytes[2..].iter().position(|b| is_sep(*b)) {
            Some(pos) => pos + 2,
            None => return 0,
        };
        let share_start = server_end + 1;
        let share_end = bytes[share_start..]
            .iter()
            .position(|b| is_sep(*b))
            .map(|pos| pos + share_start)
            .unwrap_or(bytes.len());
        if share_end > share_start {
            return share_end;
        }
    }
    0
}

impl fmt::Display for NormalizedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NormalizedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl AsRef<str> for NormalizedPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for NormalizedPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NormalizedPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}
