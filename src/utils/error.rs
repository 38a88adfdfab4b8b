//! Error taxonomy shared by every layer of the hub.
//!
//! A `PopError` is built once, where the failure is detected, and then
//! propagated with `?`. Its `ErrorKind` doubles as the JSON-RPC error code sent
//! back to the peer or client that caused it.

use std::fmt;

use thiserror::Error;

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request is well formed but not acceptable in the current state.
    InvalidAction,
    /// The request names a resource (channel, message) that does not exist.
    InvalidResource,
    /// The resource already exists. Drives the rumor stop/continue decision.
    DuplicateResource,
    /// Malformed or undecodable input.
    InvalidMessageField,
    AccessDenied,
    InternalServerError,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::InvalidAction => -1,
            ErrorKind::InvalidResource => -2,
            ErrorKind::DuplicateResource => -3,
            ErrorKind::InvalidMessageField => -4,
            ErrorKind::AccessDenied => -5,
            ErrorKind::InternalServerError => -6,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => ErrorKind::InvalidAction,
            -2 => ErrorKind::InvalidResource,
            -3 => ErrorKind::DuplicateResource,
            -4 => ErrorKind::InvalidMessageField,
            -5 => ErrorKind::AccessDenied,
            _ => ErrorKind::InternalServerError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::InvalidAction => "invalid action",
            ErrorKind::InvalidResource => "invalid resource",
            ErrorKind::DuplicateResource => "duplicate resource",
            ErrorKind::InvalidMessageField => "invalid message field",
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::InternalServerError => "internal server error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {description}")]
pub struct PopError {
    kind: ErrorKind,
    description: String,
    #[source]
    source: Option<Cause>,
}

impl PopError {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            source: None,
        }
    }

    /// Attach the lower-level error that triggered this one.
    pub fn with_source(mut self, source: impl Into<Cause>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn invalid_action(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidAction, description)
    }

    pub fn invalid_resource(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidResource, description)
    }

    pub fn duplicate_resource(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::DuplicateResource, description)
    }

    pub fn invalid_message_field(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidMessageField, description)
    }

    pub fn access_denied(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalServerError, description)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.kind.code()
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl From<sled::Error> for PopError {
    fn from(err: sled::Error) -> Self {
        PopError::internal("query database error").with_source(err)
    }
}

impl From<serde_json::Error> for PopError {
    fn from(err: serde_json::Error) -> Self {
        PopError::internal("serialization error").with_source(err)
    }
}

impl From<sled::transaction::TransactionError<PopError>> for PopError {
    fn from(err: sled::transaction::TransactionError<PopError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(err) => err,
            sled::transaction::TransactionError::Storage(err) => err.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PopError>;
