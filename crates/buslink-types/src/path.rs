//! Object paths.

use crate::error::{BusError, BusResult};
use std::fmt;

/// A validated object path, e.g. `/com/example/Settings1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Parse and validate an object path.
    ///
    /// A path starts with `/`, has no empty segments, no trailing `/` (except
    /// the root path itself), and segments made of `[A-Za-z0-9_]`.
    pub fn new(path: impl Into<String>) -> BusResult<Self> {
        let path = path.into();
        if path == "/" {
            return Ok(Self(path));
        }
        if !path.starts_with('/') || path.ends_with('/') {
            return Err(BusError::TypeMismatch(format!("invalid object path '{path}'")));
        }
        for segment in path[1..].split('/') {
            if !is_valid_segment(segment) {
                return Err(BusError::TypeMismatch(format!(
                    "invalid object path segment '{segment}' in '{path}'"
                )));
            }
        }
        Ok(Self(path))
    }

    /// The root path `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// The raw path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of a direct child node.
    pub fn join(&self, child: &str) -> BusResult<Self> {
        if !is_valid_segment(child) {
            return Err(BusError::TypeMismatch(format!("invalid child node '{child}'")));
        }
        if self.0 == "/" {
            Ok(Self(format!("/{child}")))
        } else {
            Ok(Self(format!("{}/{child}", self.0)))
        }
    }

    /// The first segment below `self` on the way to `descendant`, if
    /// `descendant` lies strictly below `self`.
    pub fn child_segment_towards(&self, descendant: &ObjectPath) -> Option<String> {
        let rest = if self.0 == "/" {
            descendant.0.strip_prefix('/')?
        } else {
            descendant.0.strip_prefix(&self.0)?.strip_prefix('/')?
        };
        if rest.is_empty() {
            return None;
        }
        rest.split('/').next().map(str::to_string)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = BusError;

    fn try_from(value: &str) -> BusResult<Self> {
        Self::new(value)
    }
}
