//! Error types for vsrpc.
//!
//! This module provides the error taxonomy used throughout the crate. The
//! call state machine and connection multiplexer use [`status_from_error`]
//! to turn a handler-raised error into the terminal [`Status`] sent in an
//! END frame, and [`is_recoverable`] to decide whether the surrounding
//! connection stays usable afterwards.

use thiserror::Error;

use crate::status::{Status, StatusCode};

/// Errors that can occur in vsrpc operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Sending on a call that has already half-closed its send side.
    #[error("call half-closed for sending")]
    HalfClosed,

    /// Operating on a call that has already reached the Closed state.
    #[error("call closed")]
    CallClosed,

    /// Operating on a connection that has reached ShuttingDown or beyond.
    #[error("connection shutting down")]
    ConnShuttingDown,

    /// Operating on a connection that has reached Closed.
    #[error("connection closed")]
    ConnClosed,

    /// Operating on a client endpoint that has reached ShuttingDown or beyond.
    #[error("client shutting down")]
    ClientShuttingDown,

    /// Operating on a client endpoint that has reached Closed.
    #[error("client closed")]
    ClientClosed,

    /// Operating on a server endpoint that has reached ShuttingDown or beyond.
    #[error("server shutting down")]
    ServerShuttingDown,

    /// Operating on a server endpoint that has reached Closed.
    #[error("server closed")]
    ServerClosed,

    /// An operation was attempted on the wrong role, e.g. `cancel()` on a
    /// server-role call.
    #[error("operation not appropriate for role: {0}")]
    Inappropriate(&'static str),

    /// A frame violated the wire protocol; fatal to the connection it was
    /// received on.
    #[error("protocol violation: {0}")]
    ProtocolViolation(Box<Error>),

    /// A BEGIN frame reused a call_id still live in the connection's table.
    #[error("duplicate call id {0}")]
    DuplicateCall(u32),

    /// A frame type was invalid for its role or context.
    #[error("unexpected frame type {0:?}")]
    FrameType(crate::proto::FrameType),

    /// A frame carried a call_id that violates the zero/non-zero rule for
    /// its type.
    #[error("invalid call id for frame type")]
    CallId,

    /// No handler matched the requested method, after exhausting the
    /// suffix-wildcard fallback chain.
    #[error("method {0:?} is not implemented")]
    NoSuchMethod(String),

    /// A frame payload failed to decode as the target protobuf type.
    #[error("failed to unmarshal {type_name}: {source}")]
    Unmarshal {
        type_name: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    /// A payload carried a type_url that did not match the expected type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// The underlying transport reported that it is permanently closed.
    #[error("transport closed")]
    TransportClosed,

    /// Transient transport I/O error.
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),

    /// The surrounding context (outer or inner) was cancelled.
    #[error("context cancelled")]
    Cancelled,

    /// A handler panicked; the panic payload is captured if it was a string.
    #[error("panic in handler: {0}")]
    Panic(String),

    /// A handler directly produced a [`Status`] to send as END.
    #[error("{0}")]
    Status(StatusError),

    /// Wraps another error, overriding its recoverability hint to `true`.
    #[error("{0}")]
    Recoverable(Box<Error>),

    /// Wraps another error, overriding its recoverability hint to `false`.
    #[error("{0}")]
    Unrecoverable(Box<Error>),
}

/// A [`Status`] carried inside an [`Error`] so it can travel through the
/// usual `?`-based error plumbing (the `AsStatus` capability in the
/// distilled taxonomy).
#[derive(Debug, Clone)]
pub struct StatusError(pub Status);

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.text.is_empty() {
            write!(f, "status {:?}", self.0.code)
        } else {
            write!(f, "{}", self.0.text)
        }
    }
}

impl std::error::Error for StatusError {}

impl Error {
    /// Builds an [`Error`] carrying a [`Status`] directly.
    pub fn status(status: Status) -> Self {
        Error::Status(StatusError(status))
    }

    /// True if this error indicates the call/connection was cancelled or the
    /// transport dropped out from under it.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Cancelled | Error::TransportClosed)
    }

    /// True if this error is one of the "handle already past its useful
    /// lifetime" family.
    pub fn is_close_error(&self) -> bool {
        matches!(
            self,
            Error::CallClosed
                | Error::ConnClosed
                | Error::ClientClosed
                | Error::ServerClosed
                | Error::ConnShuttingDown
                | Error::ClientShuttingDown
                | Error::ServerShuttingDown
        )
    }

    /// True if this error indicates the method was not implemented.
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Error::NoSuchMethod(_))
    }
}

/// Returns the explicit recoverability hint carried by [`Error::Recoverable`]
/// / [`Error::Unrecoverable`] wrappers, if any; otherwise falls back to a
/// per-variant default. Absent any hint, the default is non-recoverable —
/// matching the source's `IsRecoverable`, which treats every error as fatal
/// to its connection unless explicitly wrapped as recoverable. The one
/// per-variant exception is transient I/O: a timed-out, would-block, or
/// interrupted operation leaves the transport usable.
pub fn is_recoverable(err: &Error) -> bool {
    match err {
        Error::Recoverable(_) => true,
        Error::Unrecoverable(_) => false,
        Error::Io(io_err) => matches!(
            io_err.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
        ),
        Error::ProtocolViolation(_) | Error::TransportClosed => false,
        Error::HalfClosed
        | Error::CallClosed
        | Error::ConnShuttingDown
        | Error::ConnClosed
        | Error::ClientShuttingDown
        | Error::ClientClosed
        | Error::ServerShuttingDown
        | Error::ServerClosed => false,
        _ => false,
    }
}

/// Appends any typed detail payloads carried by the error chain to `status`,
/// outermost-first.
fn append_details(err: &Error, status: &mut Status) {
    match err {
        Error::Status(StatusError(s)) => status.details.extend(s.details.iter().cloned()),
        Error::ProtocolViolation(inner)
        | Error::Recoverable(inner)
        | Error::Unrecoverable(inner) => append_details(inner, status),
        _ => {}
    }
}

/// Converts an error into the [`Status`] that should be written as END.
///
/// If the error (or a [`Error::ProtocolViolation`]/[`Error::Recoverable`]/
/// [`Error::Unrecoverable`] wrapper around it) carries an explicit [`Status`]
/// or maps to a well-known code, that status is used; otherwise the status
/// is `{UNKNOWN, err.to_string()}`.
pub fn status_from_error(err: &Error) -> Status {
    let mut status =
        find_status(err).unwrap_or_else(|| Status::new(StatusCode::Unknown, err.to_string()));
    append_details(err, &mut status);
    status
}

fn find_status(err: &Error) -> Option<Status> {
    match err {
        Error::Status(StatusError(s)) => Some(s.clone()),
        Error::NoSuchMethod(method) => Some(Status::new(
            StatusCode::Unimplemented,
            format!("method {method:?} is not implemented"),
        )),
        Error::Unmarshal { .. } | Error::TypeMismatch { .. } => {
            Some(Status::new(StatusCode::Internal, err.to_string()))
        }
        Error::Cancelled => Some(Status::new(StatusCode::Cancelled, err.to_string())),
        Error::ProtocolViolation(inner) | Error::Recoverable(inner) | Error::Unrecoverable(inner) => {
            find_status(inner)
        }
        _ => None,
    }
}

/// Produces the status used when a connection is torn down out from under a
/// live call, e.g. on connection loss.
pub fn abort(err: &Error) -> Status {
    let mut status = Status::new(StatusCode::Aborted, err.to_string());
    append_details(err, &mut status);
    status
}

/// Result type alias using vsrpc's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_plain_error_is_unknown() {
        let status = status_from_error(&Error::CallClosed);
        assert_eq!(status.code, StatusCode::Unknown);
        assert_eq!(status.text, "call closed");
    }

    #[test]
    fn status_from_status_error_passes_through() {
        let inner = Status::new(StatusCode::PermissionDenied, "denied");
        let err = Error::status(inner.clone());
        assert_eq!(status_from_error(&err), inner);
    }

    #[test]
    fn status_from_no_such_method_is_unimplemented() {
        let err = Error::NoSuchMethod("baz.Missing".to_string());
        let status = status_from_error(&err);
        assert_eq!(status.code, StatusCode::Unimplemented);
        assert_eq!(status.text, "method \"baz.Missing\" is not implemented");
    }

    #[test]
    fn is_recoverable_defaults_to_false() {
        assert!(!is_recoverable(&Error::CallClosed));
        assert!(!is_recoverable(&Error::TransportClosed));
    }

    #[test]
    fn is_recoverable_narrows_io_errors_to_transient_kinds() {
        assert!(is_recoverable(&Error::Io(std::io::Error::from(
            std::io::ErrorKind::TimedOut
        ))));
        assert!(is_recoverable(&Error::Io(std::io::Error::from(
            std::io::ErrorKind::WouldBlock
        ))));
        assert!(!is_recoverable(&Error::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset
        ))));
        assert!(!is_recoverable(&Error::Io(std::io::Error::other("boom"))));
    }

    #[test]
    fn is_recoverable_honors_explicit_wrappers() {
        assert!(is_recoverable(&Error::Recoverable(Box::new(
            Error::TransportClosed
        ))));
        assert!(!is_recoverable(&Error::Unrecoverable(Box::new(Error::Io(
            std::io::Error::other("x")
        )))));
    }

    #[test]
    fn abort_status_has_aborted_code() {
        let status = abort(&Error::TransportClosed);
        assert_eq!(status.code, StatusCode::Aborted);
        assert_eq!(status.text, "transport closed");
    }
}
