//! Error classification
//!
//! Every retry loop in the engine asks [`classify`] whether an error is worth
//! another attempt. The decision is made from the status carried in the
//! decoded error envelope, never from message text.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Target object does not exist
    NotFound,
    /// Object is busy (in use by dependents); retry with backoff
    Locked,
    /// Network, transport or server-side failure; retry with backoff
    Transient,
    /// Anything else; abort
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Locked | ErrorClass::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::NotFound => write!(f, "not-found"),
            ErrorClass::Locked => write!(f, "locked"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        404 => ErrorClass::NotFound,
        423 => ErrorClass::Locked,
        500..=599 => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

pub fn classify(err: &Error) -> ErrorClass {
    match err {
        Error::Step { source, .. } => classify(source),
        Error::Api { status, .. } => classify_status(*status),
        Error::NotFound { .. } => ErrorClass::NotFound,
        Error::Connection(_) => ErrorClass::Transient,
        Error::HttpError(e) => {
            if e.is_decode() || e.is_builder() {
                ErrorClass::Fatal
            } else if let Some(status) = e.status() {
                classify_status(status.as_u16())
            } else {
                ErrorClass::Transient
            }
        }
        _ => ErrorClass::Fatal,
    }
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        classify(self)
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

/// Fold a NotFound failure into `Ok(None)`
pub trait NotFoundExt<T> {
    fn or_absent(self) -> Result<Option<T>>;
}

impl<T> NotFoundExt<T> for Result<T> {
    fn or_absent(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
