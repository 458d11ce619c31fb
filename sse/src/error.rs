//! Error types for the `sse` crate.

use std::error::Error as StdError;
use std::fmt;

/// Boxed error returned by application callbacks (hooks, replay sources).
pub type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug)]
pub struct Error {
    pub source: Option<BoxError>,
    pub error_kind: ErrorKind,
}

#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// An event field that must fit on one line contains a line break.
    InvalidField(&'static str),
    /// A bounded wait elapsed before the awaited event happened.
    Timeout(String),
    /// The cross-node adapter failed.
    Cluster,
    Other(String),
}

impl Error {
    pub fn new(error_kind: ErrorKind) -> Self {
        Self {
            source: None,
            error_kind,
        }
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout(what.into()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::InvalidField(field) => {
                write!(f, "SSE Error: field `{field}` must not contain line breaks")
            }
            ErrorKind::Timeout(what) => write!(f, "SSE Error: timed out waiting for {what}"),
            ErrorKind::Cluster => match &self.source {
                Some(source) => write!(f, "SSE Error: cluster adapter failed: {source}"),
                None => write!(f, "SSE Error: cluster adapter failed"),
            },
            ErrorKind::Other(msg) => write!(f, "SSE Error: {msg}"),
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

impl From<cluster::Error> for Error {
    fn from(err: cluster::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Cluster,
        }
    }
}
