//! Splitting canonical path strings into scope components.
//!
//! Canonicalization happens upstream; this module only rejects paths that
//! are clearly not canonical so they cannot silently match the wrong scope.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Deepest path (in components) a manifest or request may name.
pub const MAX_DEPTH: usize = u16::MAX as usize;

/// Errors produced while splitting a path into components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// The path was empty.
    #[error("empty path")]
    Empty,
    /// The path is not rooted at a separator or a drive designator.
    #[error("path is not absolute: {0}")]
    Relative(String),
    /// A `.` or `..` component survived canonicalization.
    #[error("non-canonical component {component:?} in {path}")]
    NonCanonical {
        /// The offending path.
        path: String,
        /// The offending component.
        component: String,
    },
    /// The path contains a NUL byte.
    #[error("path contains a NUL byte: {0:?}")]
    Nul(String),
    /// The path has more components than [`MAX_DEPTH`].
    #[error("path is deeper than {MAX_DEPTH} components")]
    TooDeep,
}

/// How path components are compared when matching scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathCase {
    /// Components match byte for byte.
    Sensitive,
    /// Components match ignoring case.
    Insensitive,
}

impl PathCase {
    /// The convention of the platform the engine was built for.
    pub const fn platform() -> Self {
        if cfg!(any(windows, target_os = "macos")) {
            PathCase::Insensitive
        } else {
            PathCase::Sensitive
        }
    }

    /// Normalize a component into its lookup key.
    pub fn key<'a>(self, component: &'a str) -> Cow<'a, str> {
        match self {
            PathCase::Sensitive => Cow::Borrowed(component),
            PathCase::Insensitive if component.chars().any(char::is_uppercase) => {
                Cow::Owned(component.to_lowercase())
            }
            PathCase::Insensitive => Cow::Borrowed(component),
        }
    }
}

impl Default for PathCase {
    fn default() -> Self {
        Self::platform()
    }
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn is_drive(component: &str) -> bool {
    let bytes = component.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Components of a validated path, borrowed from the path string.
#[derive(Debug, Clone)]
pub struct Components<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Components<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let trimmed = self.rest.trim_start_matches(is_separator);
        let end = trimmed.find(is_separator).unwrap_or(trimmed.len());
        let (component, rest) = trimmed.split_at(end);
        self.rest = rest;
        (!component.is_empty()).then_some(component)
    }
}

/// Validate an absolute, canonical path and iterate its components.
///
/// Both `/` and `\` separate components and runs of separators collapse, so
/// `\\server\share` and `/server/share` name the same scope. A path made only
/// of separators names the root and yields no components.
///
/// Nothing is allocated unless the path is rejected.
pub fn split(path: &str) -> Result<Components<'_>, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if path.contains('\0') {
        return Err(PathError::Nul(path.to_string()));
    }

    let parts = Components { rest: path };
    let rooted = path.starts_with(is_separator) || parts.clone().next().is_some_and(is_drive);
    if !rooted {
        return Err(PathError::Relative(path.to_string()));
    }

    let mut depth = 0usize;
    for component in parts.clone() {
        if component == "." || component == ".." {
            return Err(PathError::NonCanonical {
                path: path.to_string(),
                component: component.to_string(),
            });
        }
        depth += 1;
    }
    if depth > MAX_DEPTH {
        return Err(PathError::TooDeep);
    }

    Ok(parts)
}

/// Split an absolute, canonical path into its components.
///
/// Same rules as [`split`], collected.
pub fn components(path: &str) -> Result<Vec<&str>, PathError> {
    split(path).map(Iterator::collect)
}
