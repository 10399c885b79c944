//! Fully qualified names
//!
//! A fully qualified name addresses one node of the registry:
//! `"<tag>:<path>"` with tag in `var`, `alias`, `rpv`. Paths are normalized,
//! so `"var:/a/b//c/"` and `"var:a/b/c"` are the same name.

use crate::error::{Result, WatchError};
use crate::types::WatchableType;
use std::fmt;
use std::str::FromStr;

/// Split a slash path into its non-empty segments
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Canonical form of a path: a leading slash, no empty segments, no trailing slash
pub fn normalize_path(path: &str) -> String {
    join_path(split_path(path))
}

/// Join segments into a canonical path. No segments gives `/`.
pub fn join_path<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(segment.as_ref());
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// A parsed `"<tag>:<path>"` name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fqn {
    watchable_type: WatchableType,
    path: String,
}

impl Fqn {
    /// Build a name from a type and any path spelling
    pub fn make(watchable_type: WatchableType, path: &str) -> Self {
        Self {
            watchable_type,
            path: normalize_path(path),
        }
    }

    /// Parse `"<tag>:<path>"`
    pub fn parse(fqn: &str) -> Result<Self> {
        let (tag, path) = fqn
            .split_once(':')
            .ok_or_else(|| WatchError::InvalidFqn(fqn.to_string()))?;
        let watchable_type =
            WatchableType::from_tag(tag).ok_or_else(|| WatchError::InvalidFqn(fqn.to_string()))?;
        Ok(Self::make(watchable_type, path))
    }

    pub fn watchable_type(&self) -> WatchableType {
        self.watchable_type
    }

    /// Normalized path, always starting with `/`
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn segments(&self) -> Vec<&str> {
        split_path(&self.path)
    }

    /// Last path segment, empty for the root
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for Fqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.watchable_type.tag(), self.path)
    }
}

impl FromStr for Fqn {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
