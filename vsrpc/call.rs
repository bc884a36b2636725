//! The call state machine.
//!
//! A [`Call`] is identified by `(connection, call_id)` and carries the
//! per-RPC lifecycle: half-close/cancel/end semantics and an inbound queue
//! of payloads. Client-role and server-role calls share the same struct but
//! follow distinct transition tables, matching the unified `Conn`-with-
//! `Role` design chosen for the connection multiplexer (see DESIGN.md).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::frame;
use crate::lifecycle::LifecycleState;
use crate::proto::{Any, Frame, Timestamp};
use crate::queue::Queue;
use crate::status::{Status, StatusCode};

/// The side of a call: the side that allocated its id and sent BEGIN, or
/// the side that received it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Writes frames for a call's owning connection and reclaims a closed
/// call's table slot. Implemented by [`crate::conn::Conn`]; a thin seam so
/// `Call` does not need to know about the connection's locking or call
/// table directly.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn write_frame(&self, frame: Frame) -> Result<()>;

    /// Called exactly once, when the call transitions to `Closed`.
    async fn call_closed(&self, call_id: u32);
}

struct CallState {
    lifecycle: LifecycleState,
    status: Option<Status>,
}

/// A single RPC's lifecycle and inbound payload queue.
pub struct Call {
    role: Role,
    call_id: u32,
    method: String,
    sink: Arc<dyn FrameSink>,
    /// Used for writes; a locally-cancelled outer context can still send CANCEL.
    outer_ctx: Context,
    /// Cancelled when the call reaches its terminal state by any path;
    /// exposed to user handlers and streams.
    inner_ctx: Context,
    inbound: Queue<Any>,
    state: Mutex<CallState>,
    done: Notify,
}

/// A reference-counted handle to a [`Call`].
pub type ArcCall = Arc<Call>;

impl Call {
    fn new(role: Role, call_id: u32, method: String, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            role,
            call_id,
            method,
            sink,
            outer_ctx: Context::new(),
            inner_ctx: Context::new(),
            inbound: Queue::new(),
            state: Mutex::new(CallState {
                lifecycle: LifecycleState::Running,
                status: None,
            }),
            done: Notify::new(),
        }
    }

    /// Constructs the client-role call for a BEGIN the caller is about to
    /// send. `deadline`, if set, arms a watcher that cancels the call when
    /// it elapses.
    pub fn new_client(call_id: u32, method: String, sink: Arc<dyn FrameSink>, deadline: Option<SystemTime>) -> Arc<Self> {
        let call = Arc::new(Self::new(Role::Client, call_id, method, sink));
        arm_deadline(call.clone(), deadline);
        call
    }

    /// Constructs the server-role call in response to an inbound BEGIN.
    pub fn new_server(call_id: u32, method: String, sink: Arc<dyn FrameSink>, deadline: Option<SystemTime>) -> Arc<Self> {
        let call = Arc::new(Self::new(Role::Server, call_id, method, sink));
        arm_deadline(call.clone(), deadline);
        call
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The context exposed to handlers and user code: cancelled once the
    /// call reaches its terminal state.
    pub fn context(&self) -> &Context {
        &self.inner_ctx
    }

    async fn lifecycle(&self) -> LifecycleState {
        self.state.lock().await.lifecycle
    }

    /// Sends a payload: REQUEST for a client-role call, RESPONSE for a
    /// server-role call.
    pub async fn send(&self, payload: Any) -> Result<()> {
        let frame = {
            let state = self.state.lock().await;
            match self.role {
                Role::Client => match state.lifecycle {
                    LifecycleState::Running => frame::new_request(self.call_id, payload),
                    LifecycleState::Closed => return Err(Error::CallClosed),
                    _ => return Err(Error::HalfClosed),
                },
                Role::Server => match state.lifecycle {
                    LifecycleState::Closed => return Err(Error::CallClosed),
                    _ => frame::new_response(self.call_id, payload),
                },
            }
        };
        self.sink.write_frame(frame).await
    }

    /// Client-role only: closes the send side, writing HALF_CLOSE.
    /// Idempotent once ShuttingDown or later.
    pub async fn close_send(&self) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::Inappropriate("close_send is client-role only"));
        }
        let mut state = self.state.lock().await;
        match state.lifecycle {
            LifecycleState::Running => {
                state.lifecycle.advance(LifecycleState::ShuttingDown);
                drop(state);
                self.sink.write_frame(frame::new_half_close(self.call_id)).await
            }
            _ => Ok(()),
        }
    }

    /// Client-role only: abandons the call, writing CANCEL. Idempotent once
    /// GoingAway or later.
    pub async fn cancel(&self) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::Inappropriate("cancel is client-role only"));
        }
        let mut state = self.state.lock().await;
        match state.lifecycle {
            LifecycleState::Running | LifecycleState::ShuttingDown => {
                state.lifecycle.advance(LifecycleState::GoingAway);
                drop(state);
                let result = self.sink.write_frame(frame::new_cancel(self.call_id)).await;
                self.inner_ctx.cancel();
                result
            }
            _ => Ok(()),
        }
    }

    /// Server-role only: terminates the call with `status`, writing END.
    /// The second call after Closed returns `CallClosed`.
    pub async fn end(&self, status: Status) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::Inappropriate("end is server-role only"));
        }
        let mut state = self.state.lock().await;
        if state.lifecycle == LifecycleState::Closed {
            return Err(Error::CallClosed);
        }
        state.lifecycle = LifecycleState::Closed;
        state.status = Some(status.clone());
        drop(state);

        self.inbound.done().await;
        self.inner_ctx.cancel();
        let result = self.sink.write_frame(frame::new_end(self.call_id, status)).await;
        self.sink.call_closed(self.call_id).await;
        self.done.notify_waiters();
        result
    }

    /// Receives the next inbound payload (REQUEST for server-role,
    /// RESPONSE for client-role), blocking until one arrives or the inbound
    /// side is closed.
    pub async fn recv(&self) -> Option<Any> {
        let (item, _ok, _done) = self.inbound.recv(true).await;
        item
    }

    /// Current inbound queue depth, for embedders implementing cooperative
    /// backpressure against a connection's [`crate::conn::ConnConfig::inbound_queue_bound`].
    pub async fn queue_len(&self) -> usize {
        self.inbound.len().await
    }

    /// Blocks until the call reaches `Closed`, returning the terminal
    /// status (`CANCELLED` if none was ever recorded).
    pub async fn wait(&self) -> Status {
        loop {
            {
                let state = self.state.lock().await;
                if state.lifecycle == LifecycleState::Closed {
                    return state
                        .status
                        .clone()
                        .unwrap_or_else(|| Status::new(StatusCode::Cancelled, "call closed with no status"));
                }
            }
            self.done.notified().await;
        }
    }

    /// Client-role: cancel-then-wait. Server-role: abort-and-wait (marks
    /// Closed without writing a frame, for use during connection teardown).
    pub async fn close(&self) -> Status {
        match self.role {
            Role::Client => {
                let _ = self.cancel().await;
                self.wait().await
            }
            Role::Server => {
                self.abort(Error::ConnClosed).await;
                self.wait().await
            }
        }
    }

    // --- inbound dispatch, invoked by the owning Conn's read task ---

    /// Client-role: a RESPONSE arrived for this call.
    pub async fn on_response(&self, payload: Any) {
        let lifecycle = self.lifecycle().await;
        if lifecycle != LifecycleState::Closed {
            self.inbound.push(payload).await;
        }
    }

    /// Client-role: an END arrived for this call.
    pub async fn on_end(&self, status: Status) {
        let mut state = self.state.lock().await;
        if state.lifecycle == LifecycleState::Closed {
            return;
        }
        state.lifecycle = LifecycleState::Closed;
        state.status = Some(status);
        drop(state);

        self.inbound.done().await;
        self.inner_ctx.cancel();
        self.sink.call_closed(self.call_id).await;
        self.done.notify_waiters();
    }

    /// Server-role: a REQUEST arrived for this call. Returns an error (the
    /// connection's protocol-violation path) if a REQUEST arrives after
    /// HALF_CLOSE/CANCEL.
    pub async fn on_request(&self, payload: Any) -> Result<()> {
        let lifecycle = self.lifecycle().await;
        if lifecycle.at_least(LifecycleState::ShuttingDown) {
            return Err(Error::ProtocolViolation(Box::new(Error::Inappropriate(
                "REQUEST received after HALF_CLOSE or CANCEL",
            ))));
        }
        self.inbound.push(payload).await;
        Ok(())
    }

    /// Server-role: a HALF_CLOSE arrived. Idempotent.
    pub async fn on_half_close(&self) {
        let mut state = self.state.lock().await;
        if state.lifecycle.at_least(LifecycleState::ShuttingDown) {
            return;
        }
        state.lifecycle.advance(LifecycleState::ShuttingDown);
        drop(state);
        self.inbound.done().await;
    }

    /// Server-role: a CANCEL arrived. Idempotent.
    pub async fn on_cancel(&self) {
        let mut state = self.state.lock().await;
        if state.lifecycle.at_least(LifecycleState::GoingAway) {
            return;
        }
        state.lifecycle.advance(LifecycleState::GoingAway);
        drop(state);
        self.inbound.done().await;
        self.inner_ctx.cancel();
    }

    /// Invoked by the owning connection when it is torn down (abruptly or
    /// gracefully) while this call is still live: moves to Closed with an
    /// ABORTED status, without writing anything.
    pub async fn abort(&self, cause: Error) {
        let mut state = self.state.lock().await;
        if state.lifecycle == LifecycleState::Closed {
            return;
        }
        state.lifecycle = LifecycleState::Closed;
        state.status = Some(crate::error::abort(&cause));
        drop(state);

        self.inbound.done().await;
        self.inner_ctx.cancel();
        self.done.notify_waiters();
    }
}

fn arm_deadline(call: Arc<Call>, deadline: Option<SystemTime>) {
    let Some(deadline) = deadline else { return };
    let wait = deadline
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO);
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = call.inner_ctx.cancelled() => return,
        }
        match call.role {
            Role::Client => {
                let _ = call.cancel().await;
            }
            Role::Server => {
                let _ = call
                    .end(Status::new(StatusCode::DeadlineExceeded, "deadline exceeded"))
                    .await;
            }
        }
    });
}

/// Converts an absolute [`Timestamp`] into a [`SystemTime`].
pub fn timestamp_to_system_time(ts: &Timestamp) -> SystemTime {
    if ts.seconds >= 0 {
        UNIX_EPOCH + Duration::new(ts.seconds as u64, ts.nanos.max(0) as u32)
    } else {
        UNIX_EPOCH - Duration::new((-ts.seconds) as u64, 0)
    }
}

/// Converts a [`SystemTime`] into an absolute [`Timestamp`].
pub fn system_time_to_timestamp(t: SystemTime) -> Timestamp {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => Timestamp {
            seconds: d.as_secs() as i64,
            nanos: d.subsec_nanos() as i32,
        },
        Err(e) => Timestamp {
            seconds: -(e.duration().as_secs() as i64),
            nanos: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct MockSink {
        frames: StdMutex<Vec<Frame>>,
        closed_ids: StdMutex<Vec<u32>>,
    }

    impl MockSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: StdMutex::new(Vec::new()),
                closed_ids: StdMutex::new(Vec::new()),
            })
        }

        fn frames(&self) -> Vec<Frame> {
            self.frames.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FrameSink for MockSink {
        async fn write_frame(&self, frame: Frame) -> Result<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn call_closed(&self, call_id: u32) {
            self.closed_ids.lock().unwrap().push(call_id);
        }
    }

    fn any(n: i32) -> Any {
        Any {
            type_url: "test".into(),
            value: vec![n as u8],
        }
    }

    #[tokio::test]
    async fn client_send_writes_request_while_running() {
        let sink = MockSink::new();
        let call = Call::new_client(1, "foo.Bar".into(), sink.clone(), None);
        call.send(any(1)).await.unwrap();
        assert_eq!(sink.frames().len(), 1);
    }

    #[tokio::test]
    async fn client_send_fails_after_close_send() {
        let sink = MockSink::new();
        let call = Call::new_client(1, "foo.Bar".into(), sink.clone(), None);
        call.close_send().await.unwrap();
        let err = call.send(any(1)).await.unwrap_err();
        assert!(matches!(err, Error::HalfClosed));
    }

    #[tokio::test]
    async fn close_send_is_idempotent() {
        let sink = MockSink::new();
        let call = Call::new_client(1, "foo.Bar".into(), sink.clone(), None);
        call.close_send().await.unwrap();
        call.close_send().await.unwrap();
        assert_eq!(sink.frames().len(), 1);
    }

    #[tokio::test]
    async fn client_cancel_fires_inner_context() {
        let sink = MockSink::new();
        let call = Call::new_client(1, "foo.Bar".into(), sink.clone(), None);
        call.cancel().await.unwrap();
        assert!(call.context().is_cancelled());
        call.cancel().await.unwrap();
        assert_eq!(sink.frames().len(), 1);
    }

    #[tokio::test]
    async fn client_on_end_closes_and_records_status() {
        let sink = MockSink::new();
        let call = Call::new_client(1, "foo.Bar".into(), sink.clone(), None);
        call.on_end(Status::new(StatusCode::NotFound, "gone")).await;
        let status = call.wait().await;
        assert_eq!(status.code, StatusCode::NotFound);
        assert!(call.context().is_cancelled());
    }

    #[tokio::test]
    async fn client_on_response_after_closed_is_discarded() {
        let sink = MockSink::new();
        let call = Call::new_client(1, "foo.Bar".into(), sink.clone(), None);
        call.on_end(Status::ok()).await;
        call.on_response(any(9)).await;
        assert!(call.inbound.is_empty().await);
    }

    #[tokio::test]
    async fn server_end_writes_end_and_closes() {
        let sink = MockSink::new();
        let call = Call::new_server(1, "foo.Bar".into(), sink.clone(), None);
        call.end(Status::ok()).await.unwrap();
        assert_eq!(sink.frames().len(), 1);
        assert_eq!(sink.closed_ids.lock().unwrap().as_slice(), &[1]);

        let err = call.end(Status::ok()).await.unwrap_err();
        assert!(matches!(err, Error::CallClosed));
    }

    #[tokio::test]
    async fn server_request_after_half_close_is_protocol_violation() {
        let sink = MockSink::new();
        let call = Call::new_server(1, "foo.Bar".into(), sink.clone(), None);
        call.on_half_close().await;
        let err = call.on_request(any(1)).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn server_recv_returns_queued_request_then_blocks_until_half_close() {
        let sink = MockSink::new();
        let call = Call::new_server(1, "foo.Bar".into(), sink.clone(), None);
        call.on_request(any(5)).await.unwrap();
        let got = call.recv().await;
        assert_eq!(got, Some(any(5)));

        call.on_half_close().await;
        let got = call.recv().await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn abort_marks_closed_with_aborted_status() {
        let sink = MockSink::new();
        let call = Call::new_server(1, "foo.Bar".into(), sink.clone(), None);
        call.abort(Error::TransportClosed).await;
        let status = call.wait().await;
        assert_eq!(status.code, StatusCode::Aborted);
    }

    #[tokio::test]
    async fn timestamp_round_trips_through_system_time() {
        let ts = Timestamp {
            seconds: 1_700_000_000,
            nanos: 500,
        };
        let t = timestamp_to_system_time(&ts);
        let back = system_time_to_timestamp(t);
        assert_eq!(back, ts);
    }
}
