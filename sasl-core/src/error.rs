use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the handshake, the codec and the stream adapters can report.
///
/// Nothing here is retried by the library: callers are expected to abort the
/// connection on any of them except `Io` errors they know how to handle.
#[derive(Error, Debug)]
pub enum Error {
    /// None of the offered mechanisms can be used with this configuration.
    #[error("Mechanism negotiation failed: {0}")]
    MechanismNegotiationFailed(String),

    /// The engine asked for information nobody could provide.
    #[error("Interaction unresolved: {0}")]
    InteractionUnresolved(String),

    /// The operation is not valid in the current session state.
    #[error("Operation '{operation}' is invalid in state {state}")]
    InvalidSessionState {
        operation: &'static str,
        state: String,
    },

    /// The engine reported an unrecoverable failure, text is the engine diagnostic.
    #[error("Session failed: {0}")]
    SessionFailed(String),

    /// Fewer bytes than a frame header declares are available.
    #[error("Truncated frame: {expected} bytes declared, only {available} available")]
    TruncatedFrame { expected: usize, available: usize },

    /// The frame was rejected (size, integrity or sequencing).
    #[error("Corrupt frame: {0}")]
    CorruptFrame(String),

    /// An adapter was requested before the handshake completed.
    #[error("Handshake is not complete")]
    HandshakeNotComplete,

    /// The underlying writer accepted only part of a frame.
    #[error("Short write: {written} of {expected} frame bytes delivered")]
    ShortWrite { written: usize, expected: usize },

    /// A registry was used before `initialize` was called.
    #[error("Authentication engines are not initialized")]
    NotInitialized,

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A handshake payload line is not valid base64.
    #[error("Invalid segment: {0}")]
    InvalidSegment(String),

    /// The peer abandoned the exchange.
    #[error("Exchange cancelled by peer")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Recover the typed error an adapter wrapped into an `io::Error`.
    pub fn from_io(error: io::Error) -> Self {
        let wrapped = error.get_ref().map_or(false, |inner| inner.is::<Error>());
        if !wrapped {
            return Error::Io(error);
        }

        match error.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(typed)) => *typed,
            Some(Err(other)) => Error::Io(io::Error::new(io::ErrorKind::Other, other)),
            None => Error::Io(io::Error::new(io::ErrorKind::Other, "empty IO error")),
        }
    }

    /// True for the framing and integrity errors that poison a byte stream.
    pub fn is_framing(&self) -> bool {
        matches!(self, Error::TruncatedFrame { .. } | Error::CorruptFrame(_))
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(io_error) => io_error,
            other => {
                let kind = match &other {
                    Error::TruncatedFrame { .. } => io::ErrorKind::UnexpectedEof,
                    Error::CorruptFrame(_) => io::ErrorKind::InvalidData,
                    Error::ShortWrite { .. } => io::ErrorKind::WriteZero,
                    Error::SessionFailed(_) => io::ErrorKind::PermissionDenied,
                    Error::HandshakeNotComplete | Error::NotInitialized => {
                        io::ErrorKind::NotConnected
                    }
                    _ => io::ErrorKind::Other,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_round_trip_keeps_variant() {
        let err: io::Error = Error::TruncatedFrame {
            expected: 10,
            available: 9,
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        match Error::from_io(err) {
            Error::TruncatedFrame {
                expected: 10,
                available: 9,
            } => (),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(Error::from_io(err), Error::Io(e) if e.kind() == io::ErrorKind::BrokenPipe));

        let back: io::Error = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).into();
        assert_eq!(back.kind(), io::ErrorKind::BrokenPipe);
    }
}
