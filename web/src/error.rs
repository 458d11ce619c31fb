use std::error::Error as StdError;
use std::fmt;

use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use log::*;

use crate::dispatch::DispatchError;
use crate::schema::ValidationError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// Request body is not JSON.
    MalformedBody,
    /// Request body failed the route's body schema.
    InvalidBody(String),
    NotFound,
    /// Sync handler output failed the route's response schema.
    InvalidResponse(String),
    /// Sync handler omitted a header the route declares as required.
    MissingHeader(String),
    Dispatch(DispatchError),
    Other(String),
}

impl Error {
    pub fn new(error_kind: ErrorKind) -> Self {
        Self {
            source: None,
            error_kind,
        }
    }

    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound)
    }

    pub fn invalid_body(error: ValidationError) -> Self {
        Self::new(ErrorKind::InvalidBody(error.message))
    }

    pub fn invalid_response(error: ValidationError) -> Self {
        Self::new(ErrorKind::InvalidResponse(error.message))
    }

    pub fn missing_header(name: &HeaderName) -> Self {
        Self::new(ErrorKind::MissingHeader(name.to_string()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::MalformedBody => match &self.source {
                Some(source) => write!(f, "Web Error: malformed JSON body: {source}"),
                None => write!(f, "Web Error: malformed JSON body"),
            },
            ErrorKind::InvalidBody(msg) => write!(f, "Web Error: invalid request body: {msg}"),
            ErrorKind::NotFound => write!(f, "Web Error: not found"),
            ErrorKind::InvalidResponse(msg) => {
                write!(f, "Web Error: response failed its schema: {msg}")
            }
            ErrorKind::MissingHeader(name) => {
                write!(f, "Web Error: response is missing required header `{name}`")
            }
            ErrorKind::Dispatch(fault) => write!(f, "{fault}"),
            ErrorKind::Other(msg) => write!(f, "Web Error: {msg}"),
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

impl From<DispatchError> for Error {
    fn from(fault: DispatchError) -> Self {
        Self::new(ErrorKind::Dispatch(fault))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::MalformedBody,
        }
    }
}

// List of possible StatusCode variants https://docs.rs/http/latest/http/status/struct.StatusCode.html#associatedconstant.UNPROCESSABLE_ENTITY
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self.error_kind {
            ErrorKind::MalformedBody => (StatusCode::BAD_REQUEST, "BAD REQUEST").into_response(),
            ErrorKind::InvalidBody(msg) => {
                debug!("Rejecting request body: {msg}");
                (StatusCode::UNPROCESSABLE_ENTITY, "UNPROCESSABLE ENTITY").into_response()
            }
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "NOT FOUND").into_response(),
            ErrorKind::InvalidResponse(_)
            | ErrorKind::MissingHeader(_)
            | ErrorKind::Dispatch(_)
            | ErrorKind::Other(_) => {
                error!("{self}");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL SERVER ERROR").into_response()
            }
        }
    }
}
