//! Error types for the reconciliation engine

use std::time::Duration;

use thiserror::Error;

use crate::controller::Kind;

#[derive(Error, Debug)]
pub enum Error {
    /// Non-success response from the control plane, decoded from its error envelope
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// HTTP transport failure (connect, TLS, timeout, body decode)
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Connection-level failure reported without a reqwest error (e.g. refused)
    #[error("connection error: {0}")]
    Connection(String),

    /// Failed to (de)serialize a request or response body
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Object is absent where the remote side signals absence without a 404
    #[error("{kind} {id} not found")]
    NotFound { kind: Kind, id: String },

    /// A remote task reached the `failed` state
    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    /// Budget exhausted while waiting for an operation to finish
    #[error("{operation} timed out after {}s{}", .budget.as_secs(), detail(.last_error))]
    Timeout {
        operation: String,
        budget: Duration,
        last_error: Option<String>,
    },

    /// Caller cancelled the reconciliation at a suspension point
    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    /// Object disappeared right after the engine created or changed it
    #[error("{kind} {id} disappeared after {step}")]
    Vanished {
        kind: Kind,
        id: String,
        step: &'static str,
    },

    /// Session could not be established with the control plane
    #[error("authentication to {host} failed: {source}")]
    Authentication {
        host: String,
        #[source]
        source: Box<Error>,
    },

    /// The control plane answered with something the engine cannot use
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Desired spec is not acceptable
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Wraps an error with the reconciliation step that produced it
    #[error("{step}: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<Error>,
    },
}

fn detail(last_error: &Option<String>) -> String {
    last_error
        .as_deref()
        .map(|e| format!(" (last error: {e})"))
        .unwrap_or_default()
}

impl Error {
    /// Attach the name of the reconciliation step that produced this error
    pub fn at(self, step: impl Into<String>) -> Self {
        Error::Step {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through step and authentication wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } | Error::Authentication { source, .. } => source.root(),
            other => other,
        }
    }

    /// The message the control plane attached to this failure, if any
    pub fn remote_message(&self) -> Option<&str> {
        match self.root() {
            Error::Api { message, .. } => Some(message),
            Error::TaskFailed { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::ValidationError(msg.into())
    }

    pub fn unexpected(msg: impl Into<String>) -> Self {
        Error::UnexpectedResponse(msg.into())
    }
}

/// Attach a step name to the error side of a result
pub trait StepContext<T> {
    fn step(self, step: impl Into<String>) -> Result<T>;
}

impl<T> StepContext<T> for Result<T> {
    fn step(self, step: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.at(step))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
