//! Status codes and the terminal call outcome carried by END frames.

use crate::proto;

/// A subset of well-known RPC status codes.
///
/// Numeric values are chosen to match the widely used gRPC status code
/// table so that `code` survives round-trips through the wire `int32`
/// field even when decoded by a peer that only knows the numeric values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StatusCode {
    #[default]
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            // 2 and any unrecognized value fall back to Unknown.
            _ => StatusCode::Unknown,
        }
    }
}

/// The terminal outcome of a call, carried by an END frame.
///
/// A status is OK iff it is absent or its code is [`StatusCode::Ok`]; callers
/// that receive no END at all (e.g. on connection loss) are handed a
/// synthetic [`StatusCode::Aborted`] status instead (see [`crate::error::abort`]).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Status {
    pub code: StatusCode,
    pub text: String,
    pub details: Vec<proto::Any>,
    pub can_retry: bool,
}

impl Status {
    /// The canonical OK status.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Builds a status with the given code and text, no details, not retryable.
    pub fn new(code: StatusCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            details: Vec::new(),
            can_retry: false,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl From<Status> for proto::Status {
    fn from(s: Status) -> Self {
        proto::Status {
            code: s.code.as_i32(),
            text: s.text,
            details: s.details,
            can_retry: s.can_retry,
        }
    }
}

impl From<proto::Status> for Status {
    fn from(s: proto::Status) -> Self {
        Status {
            code: StatusCode::from_i32(s.code),
            text: s.text,
            details: s.details,
            can_retry: s.can_retry,
        }
    }
}
