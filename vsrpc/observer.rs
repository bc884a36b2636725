//! Pluggable observability hooks.
//!
//! The connection multiplexer and endpoints accept a list of [`EventSink`]s
//! and fan out one call per sink per event, each on its own spawned task —
//! a sink can never block the read loop or an endpoint's accept/dial path.
//! Every method defaults to a no-op, so a sink only implements the events it
//! cares about.

use std::sync::Arc;

use crate::call::ArcCall;
use crate::conn::ArcConn;
use crate::proto::Any;
use crate::status::Status;

/// One callback per protocol-level event.
pub trait EventSink: Send + Sync {
    fn on_accept(&self, _conn: ArcConn) {}
    fn on_accept_error(&self, _err: String) {}
    fn on_dial(&self, _conn: ArcConn) {}
    fn on_dial_error(&self, _err: String) {}

    fn on_begin(&self, _call: ArcCall) {}
    fn on_request(&self, _call: ArcCall, _payload: Any) {}
    fn on_response(&self, _call: ArcCall, _payload: Any) {}
    fn on_half_close(&self, _call: ArcCall) {}
    fn on_cancel(&self, _call: ArcCall) {}
    fn on_end(&self, _call: ArcCall, _status: Status) {}

    fn on_shutdown(&self, _conn: ArcConn) {}
    fn on_go_away(&self, _conn: ArcConn) {}

    fn on_read_error(&self, _conn: ArcConn, _err: String) {}
    fn on_write_error(&self, _conn: ArcConn, _err: String) {}
    fn on_close(&self, _conn: ArcConn) {}
}

pub type ArcEventSink = Arc<dyn EventSink>;

pub(crate) fn dispatch_accept(sinks: &[ArcEventSink], conn: ArcConn) {
    for sink in sinks {
        let sink = sink.clone();
        let conn = conn.clone();
        tokio::spawn(async move { sink.on_accept(conn) });
    }
}

pub(crate) fn dispatch_accept_error(sinks: &[ArcEventSink], err: String) {
    for sink in sinks {
        let sink = sink.clone();
        let err = err.clone();
        tokio::spawn(async move { sink.on_accept_error(err) });
    }
}

pub(crate) fn dispatch_dial(sinks: &[ArcEventSink], conn: ArcConn) {
    for sink in sinks {
        let sink = sink.clone();
        let conn = conn.clone();
        tokio::spawn(async move { sink.on_dial(conn) });
    }
}

pub(crate) fn dispatch_dial_error(sinks: &[ArcEventSink], err: String) {
    for sink in sinks {
        let sink = sink.clone();
        let err = err.clone();
        tokio::spawn(async move { sink.on_dial_error(err) });
    }
}

pub(crate) fn dispatch_begin(sinks: &[ArcEventSink], call: ArcCall) {
    for sink in sinks {
        let sink = sink.clone();
        let call = call.clone();
        tokio::spawn(async move { sink.on_begin(call) });
    }
}

pub(crate) fn dispatch_request(sinks: &[ArcEventSink], call: ArcCall, payload: Any) {
    for sink in sinks {
        let sink = sink.clone();
        let call = call.clone();
        let payload = payload.clone();
        tokio::spawn(async move { sink.on_request(call, payload) });
    }
}

pub(crate) fn dispatch_response(sinks: &[ArcEventSink], call: ArcCall, payload: Any) {
    for sink in sinks {
        let sink = sink.clone();
        let call = call.clone();
        let payload = payload.clone();
        tokio::spawn(async move { sink.on_response(call, payload) });
    }
}

pub(crate) fn dispatch_half_close(sinks: &[ArcEventSink], call: ArcCall) {
    for sink in sinks {
        let sink = sink.clone();
        let call = call.clone();
        tokio::spawn(async move { sink.on_half_close(call) });
    }
}

pub(crate) fn dispatch_cancel(sinks: &[ArcEventSink], call: ArcCall) {
    for sink in sinks {
        let sink = sink.clone();
        let call = call.clone();
        tokio::spawn(async move { sink.on_cancel(call) });
    }
}

pub(crate) fn dispatch_end(sinks: &[ArcEventSink], call: ArcCall, status: Status) {
    for sink in sinks {
        let sink = sink.clone();
        let call = call.clone();
        let status = status.clone();
        tokio::spawn(async move { sink.on_end(call, status) });
    }
}

pub(crate) fn dispatch_shutdown(sinks: &[ArcEventSink], conn: ArcConn) {
    for sink in sinks {
        let sink = sink.clone();
        let conn = conn.clone();
        tokio::spawn(async move { sink.on_shutdown(conn) });
    }
}

pub(crate) fn dispatch_go_away(sinks: &[ArcEventSink], conn: ArcConn) {
    for sink in sinks {
        let sink = sink.clone();
        let conn = conn.clone();
        tokio::spawn(async move { sink.on_go_away(conn) });
    }
}

pub(crate) fn dispatch_read_error(sinks: &[ArcEventSink], conn: ArcConn, err: String) {
    for sink in sinks {
        let sink = sink.clone();
        let conn = conn.clone();
        let err = err.clone();
        tokio::spawn(async move { sink.on_read_error(conn, err) });
    }
}

pub(crate) fn dispatch_write_error(sinks: &[ArcEventSink], conn: ArcConn, err: String) {
    for sink in sinks {
        let sink = sink.clone();
        let conn = conn.clone();
        let err = err.clone();
        tokio::spawn(async move { sink.on_write_error(conn, err) });
    }
}

pub(crate) fn dispatch_close(sinks: &[ArcEventSink], conn: ArcConn) {
    for sink in sinks {
        let sink = sink.clone();
        let conn = conn.clone();
        tokio::spawn(async move { sink.on_close(conn) });
    }
}
