//! Our error types for the EstCard link.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Crate wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed format string, or not enough bytes to decode it.
    #[error("Format error: {0}")]
    Format(String),
    /// A value does not fit its binary representation or declared range.
    #[error("Value out of range: {0}")]
    Range(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn range(msg: impl Into<String>) -> Self {
        Error::Range(msg.into())
    }

    /// Wrap this error as the cause of a new protocol error.
    ///
    /// Non protocol errors are rendered into the cause message.
    pub fn context(self, msg: impl Into<String>) -> Self {
        match self {
            Error::Protocol(cause) => Error::Protocol(ProtocolError::caused_by(msg, cause)),
            other => Error::Protocol(ProtocolError::caused_by(
                msg,
                ProtocolError::new(other.to_string()),
            )),
        }
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Any failure on the wire: timeouts, rejected commands, bad escapes, truncated replies.
///
/// Errors are chained from the innermost cause outwards, see [`ProtocolError::chain`].
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ProtocolError {
    message: String,
    #[source]
    cause: Option<Box<ProtocolError>>,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn caused_by(message: impl Into<String>, cause: ProtocolError) -> Self {
        Self {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Build a protocol error from a serial layer error.
    pub fn io<E: embedded_io::Error>(message: impl Into<String>, err: E) -> Self {
        Self::caused_by(message, ProtocolError::new(format!("{:?}", err.kind())))
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&ProtocolError> {
        self.cause.as_deref()
    }

    /// Human readable rendering of the whole cause chain, outermost first.
    pub fn chain(&self) -> String {
        let mut text = self.message.clone();
        let mut next = self.cause();
        while let Some(cause) = next {
            text.push_str("\ncause: ");
            text.push_str(&cause.message);
            next = cause.cause();
        }
        text
    }

    /// Depth of the chain, counting this error.
    pub fn depth(&self) -> usize {
        1 + self.cause().map_or(0, ProtocolError::depth)
    }
}
