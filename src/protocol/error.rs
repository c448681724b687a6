//! Error types for request body intake.
//!
//! Three error kinds reach application handlers:
//!
//! - [`BodyError::AlreadyRead`]: the body was already handed to a reader or
//!   drained. Handlers must read the body at most once.
//! - [`BodyError::ConnectionClosed`]: the channel closed before the terminal
//!   chunk arrived. Non-recoverable for the request.
//! - [`BodyError::TooLarge`]: the body exceeded the configured ceiling; all
//!   held bytes have been discarded by the time the error is observed.
//!
//! Channel write failures while sending the continue preface surface as
//! [`BodyError::Channel`] on the active reader.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BodyError {
    /// The body was already handed to a reader or drained.
    #[error("request body has already been read")]
    AlreadyRead,

    /// The connection closed before the body was fully received.
    #[error("connection closed before the request body was fully received")]
    ConnectionClosed { reason: Option<String> },

    /// The body exceeds the configured size ceiling.
    #[error("request body too large, received: {length} exceed the limit {limit}")]
    TooLarge { limit: i64, length: i64 },

    /// I/O failure on the underlying channel.
    #[error("channel error: {source}")]
    Channel {
        #[from]
        source: io::Error,
    },
}

impl BodyError {
    pub fn already_read() -> Self {
        Self::AlreadyRead
    }

    pub fn connection_closed(reason: Option<String>) -> Self {
        Self::ConnectionClosed { reason }
    }

    pub fn too_large(limit: i64, length: i64) -> Self {
        Self::TooLarge { limit, length }
    }

    pub fn channel<E: Into<io::Error>>(e: E) -> Self {
        Self::Channel { source: e.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_limit_and_length() {
        let e = BodyError::too_large(100, 120);
        assert_eq!(e.to_string(), "request body too large, received: 120 exceed the limit 100");
    }

    #[test]
    fn io_error_converts() {
        let e: BodyError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(e, BodyError::Channel { .. }));
    }
}
