//! Frame construction and validation.
//!
//! A [`crate::proto::Frame`] is the sole message exchanged on the wire, one
//! per packet. This module provides one constructor per frame type and the
//! validation rules from the wire format (§6 of the protocol description):
//! `call_id` is zero iff the type is one of NO_OP/SHUTDOWN/GO_AWAY, BEGIN
//! always carries a non-empty method, and so on.

use crate::error::{Error, Result};
use crate::proto::{Any, Frame, FrameType, Timestamp};
use crate::status::Status;

fn frame(r#type: FrameType) -> Frame {
    Frame {
        r#type: r#type as i32,
        call_id: 0,
        method: String::new(),
        deadline: None,
        payload: None,
        status: None,
    }
}

/// Builds a NO_OP frame. Carries no call id; either direction ignores it.
pub fn new_no_op() -> Frame {
    frame(FrameType::NoOp)
}

/// Builds a SHUTDOWN frame (client → server, graceful shutdown request).
pub fn new_shutdown() -> Frame {
    frame(FrameType::Shutdown)
}

/// Builds a GO_AWAY frame (server → client, graceful shutdown acknowledgement).
pub fn new_go_away() -> Frame {
    frame(FrameType::GoAway)
}

/// Builds a BEGIN frame starting a new call.
pub fn new_begin(call_id: u32, method: impl Into<String>, deadline: Option<Timestamp>) -> Frame {
    Frame {
        call_id,
        method: method.into(),
        deadline,
        ..frame(FrameType::Begin)
    }
}

/// Builds a REQUEST frame (client → server payload).
pub fn new_request(call_id: u32, payload: Any) -> Frame {
    Frame {
        call_id,
        payload: Some(payload),
        ..frame(FrameType::Request)
    }
}

/// Builds a RESPONSE frame (server → client payload).
pub fn new_response(call_id: u32, payload: Any) -> Frame {
    Frame {
        call_id,
        payload: Some(payload),
        ..frame(FrameType::Response)
    }
}

/// Builds a HALF_CLOSE frame (client closes its send side of a call).
pub fn new_half_close(call_id: u32) -> Frame {
    Frame {
        call_id,
        ..frame(FrameType::HalfClose)
    }
}

/// Builds a CANCEL frame (client abandons a call).
pub fn new_cancel(call_id: u32) -> Frame {
    Frame {
        call_id,
        ..frame(FrameType::Cancel)
    }
}

/// Builds an END frame (server terminates a call with a status).
pub fn new_end(call_id: u32, status: Status) -> Frame {
    Frame {
        call_id,
        status: Some(status.into()),
        ..frame(FrameType::End)
    }
}

/// Validates a decoded frame against the wire format's per-type field rules.
///
/// On violation, returns an [`Error::ProtocolViolation`] wrapping the more
/// specific cause (fatal to the connection the frame arrived on).
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

impl Validate for Frame {
    fn validate(&self) -> Result<()> {
        let frame_type = frame_type(self)?;

        let call_id_must_be_zero = matches!(
            frame_type,
            FrameType::NoOp | FrameType::Shutdown | FrameType::GoAway
        );
        if call_id_must_be_zero != (self.call_id == 0) {
            return Err(Error::ProtocolViolation(Box::new(Error::CallId)));
        }

        if frame_type == FrameType::Begin && self.method.is_empty() {
            return Err(Error::ProtocolViolation(Box::new(Error::Inappropriate(
                "BEGIN requires a non-empty method",
            ))));
        }

        Ok(())
    }
}

fn frame_type(f: &Frame) -> Result<FrameType> {
    FrameType::try_from(f.r#type)
        .map_err(|_| Error::ProtocolViolation(Box::new(Error::FrameType(FrameType::NoOp))))
}

/// Returns the frame's validated [`FrameType`], or a protocol violation if
/// the wire `i32` does not correspond to any known variant.
pub fn kind(f: &Frame) -> Result<FrameType> {
    frame_type(f)
}

/// Extracts the [`Status`] carried by an END frame, defaulting to OK if the
/// field is absent (permitted by "a status is OK iff it is absent or its
/// code is OK").
pub fn end_status(f: &Frame) -> Status {
    f.status.clone().map(Status::from).unwrap_or_else(Status::ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    #[test]
    fn begin_carries_method_and_deadline() {
        let f = new_begin(1, "foo.Bar", Some(Timestamp { seconds: 5, nanos: 0 }));
        assert_eq!(f.call_id, 1);
        assert_eq!(f.method, "foo.Bar");
        assert!(f.deadline.is_some());
        assert!(f.validate().is_ok());
    }

    #[test]
    fn no_op_has_zero_call_id() {
        let f = new_no_op();
        assert_eq!(f.call_id, 0);
        assert!(f.validate().is_ok());
    }

    #[test]
    fn validate_rejects_nonzero_call_id_on_shutdown() {
        let mut f = new_shutdown();
        f.call_id = 1;
        assert!(f.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_call_id_on_begin() {
        let f = new_begin(0, "foo.Bar", None);
        assert!(f.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_method_on_begin() {
        let f = new_begin(1, "", None);
        assert!(f.validate().is_err());
    }

    #[test]
    fn end_status_defaults_to_ok_when_absent() {
        let f = Frame {
            r#type: FrameType::End as i32,
            call_id: 1,
            method: String::new(),
            deadline: None,
            payload: None,
            status: None,
        };
        assert!(end_status(&f).is_ok());
    }

    #[test]
    fn end_carries_given_status() {
        let status = Status::new(StatusCode::NotFound, "missing");
        let f = new_end(1, status.clone());
        assert_eq!(end_status(&f), status);
    }
}
