//! Error types for the `cluster` crate.
//!
//! Follows the same pattern as the other crates in the workspace: a root
//! `Error` struct holding an error kind and an optional source.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Categories of failures an adapter can report.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// The backing store could not be reached or the connection dropped.
    Connection,
    /// An operation that needs a live connection was called before `connect`.
    NotConnected,
    Subscribe,
    Publish,
    /// The outgoing envelope could not be serialized.
    Encode,
}

impl Error {
    pub fn new(error_kind: ErrorKind) -> Self {
        Self {
            source: None,
            error_kind,
        }
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorKind::NotConnected)
    }

    pub fn with_source(
        error_kind: ErrorKind,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            source: Some(source.into()),
            error_kind,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "Cluster Error: {:?}: {}", self.error_kind, source),
            None => write!(f, "Cluster Error: {:?}", self.error_kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::with_source(ErrorKind::Connection, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::with_source(ErrorKind::Encode, err)
    }
}
