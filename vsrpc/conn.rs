//! The connection multiplexer.
//!
//! A [`Conn`] owns one [`PacketConnection`], a table of live [`Call`]s keyed
//! by `call_id`, and the connection-level lifecycle. It is parameterized by
//! [`Role`]: a client-role `Conn` allocates call ids and writes BEGIN; a
//! server-role `Conn` accepts BEGIN and spawns a handler task per call (see
//! [`crate::router`]). One read task per `Conn`, spawned at construction,
//! decodes frames and routes them per §4.5 of the protocol description.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

use crate::call::{self, ArcCall, Call, FrameSink, Role};
use crate::codec;
use crate::context::Context;
use crate::error::{self, Error, Result};
use crate::frame::{self, Validate};
use crate::lifecycle::LifecycleState;
use crate::observer::{self, ArcEventSink};
use crate::proto::{Any, Frame, FrameType};
use crate::router::{self, Router};
use crate::status::Status;
use crate::transport::{PacketConnection, TransportConfig};

static NEXT_CONN_ID: AtomicU32 = AtomicU32::new(1);

/// Per-connection tunables.
///
/// `inbound_queue_bound` is advisory: per §4.3, a [`crate::queue::Queue`]
/// never rejects a push, so enforcing it is left to the embedder — e.g. a
/// handler or transport watching [`Call::queue_len`](crate::call::Call::queue_len)
/// and slowing its reads once the bound is reached.
#[derive(Clone)]
pub struct ConnConfig {
    pub transport: TransportConfig,
    pub inbound_queue_bound: usize,
    /// Event sinks notified of this connection's lifecycle and call events.
    pub sinks: Vec<ArcEventSink>,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            inbound_queue_bound: 64,
            sinks: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ConnConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnConfig")
            .field("transport", &self.transport)
            .field("inbound_queue_bound", &self.inbound_queue_bound)
            .field("sinks", &format_args!("[{} sink(s)]", self.sinks.len()))
            .finish()
    }
}

struct Table {
    calls: HashMap<u32, ArcCall>,
    next_id: u32,
}

impl Table {
    fn new() -> Self {
        Self {
            calls: HashMap::new(),
            next_id: 0,
        }
    }

    /// Allocates a fresh call id per the policy in §4.5: start from the
    /// previously allocated id (reusing it directly if it has since freed
    /// up), resetting to 1 whenever the counter is exhausted or has grown
    /// disproportionate to the table, then linearly probe for a slot not
    /// already occupied by a live call.
    fn allocate_id(&mut self) -> u32 {
        let mut id = self.next_id;
        if id == 0 || self.calls.is_empty() || id as usize > self.calls.len() * 2 {
            id = 1;
        }
        while self.calls.contains_key(&id) {
            id = id.wrapping_add(1);
            if id == 0 {
                id = 1;
            }
        }
        self.next_id = id;
        id
    }
}

struct ConnState {
    lifecycle: LifecycleState,
}

/// A single multiplexed connection: one transport, many concurrent calls.
pub struct Conn {
    id: u32,
    role: Role,
    transport: Arc<dyn PacketConnection>,
    router: Option<Arc<Router>>,
    sinks: Vec<ArcEventSink>,
    config: ConnConfig,
    table: Mutex<Table>,
    state: Mutex<ConnState>,
    closed: Notify,
    ctx: Context,
    weak_self: Weak<Conn>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").field("id", &self.id).field("role", &self.role).finish_non_exhaustive()
    }
}

pub type ArcConn = Arc<Conn>;

impl Conn {
    /// Wraps `transport` as a client-role connection: calls originate here
    /// via [`Conn::begin`].
    pub fn new_client(transport: Arc<dyn PacketConnection>) -> ArcConn {
        Self::new(Role::Client, transport, None, ConnConfig::default())
    }

    /// Wraps `transport` as a server-role connection: inbound BEGIN frames
    /// are dispatched to `router`.
    pub fn new_server(transport: Arc<dyn PacketConnection>, router: Arc<Router>) -> ArcConn {
        Self::new(Role::Server, transport, Some(router), ConnConfig::default())
    }

    /// Like [`Conn::new_client`], with non-default tunables.
    pub fn new_client_with_config(transport: Arc<dyn PacketConnection>, config: ConnConfig) -> ArcConn {
        Self::new(Role::Client, transport, None, config)
    }

    /// Like [`Conn::new_server`], with non-default tunables.
    pub fn new_server_with_config(transport: Arc<dyn PacketConnection>, router: Arc<Router>, config: ConnConfig) -> ArcConn {
        Self::new(Role::Server, transport, Some(router), config)
    }

    fn new(role: Role, transport: Arc<dyn PacketConnection>, router: Option<Arc<Router>>, config: ConnConfig) -> ArcConn {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let sinks = config.sinks.clone();
        let conn = Arc::new_cyclic(|weak_self| Self {
            id,
            role,
            transport,
            router,
            sinks,
            config,
            table: Mutex::new(Table::new()),
            state: Mutex::new(ConnState {
                lifecycle: LifecycleState::Running,
            }),
            closed: Notify::new(),
            ctx: Context::new(),
            weak_self: weak_self.clone(),
        });
        debug!(conn_id = id, role = ?role, "connection established");
        spawn_read_loop(conn.clone());
        conn
    }

    /// Upgrades this connection's self-reference. Always succeeds for a
    /// `Conn` reached through an `ArcConn`, since the strong count can't
    /// drop to zero while a method is running on it.
    fn arc(&self) -> ArcConn {
        self.weak_self
            .upgrade()
            .expect("Conn outlives its own weak self-reference")
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    async fn lifecycle(&self) -> LifecycleState {
        self.state.lock().await.lifecycle
    }

    /// Blocks until the connection reaches `Closed`.
    pub async fn closed(&self) {
        loop {
            if self.lifecycle().await == LifecycleState::Closed {
                return;
            }
            self.closed.notified().await;
        }
    }

    /// Client-role: starts a new call, writing BEGIN. Fails with
    /// `ConnShuttingDown`/`ConnClosed` once the connection has moved past
    /// Running.
    pub async fn begin(self: &Arc<Self>, method: impl Into<String>, deadline: Option<SystemTime>) -> Result<ArcCall> {
        if self.role != Role::Client {
            return Err(Error::Inappropriate("begin is client-role only"));
        }
        let lifecycle = self.lifecycle().await;
        if lifecycle == LifecycleState::Closed {
            return Err(Error::ConnClosed);
        }
        if lifecycle >= LifecycleState::ShuttingDown {
            return Err(Error::ConnShuttingDown);
        }

        let method = method.into();
        let call_id = {
            let mut table = self.table.lock().await;
            table.allocate_id()
        };

        let proto_deadline = deadline.map(call::system_time_to_timestamp);
        let sink: Arc<dyn FrameSink> = self.clone();
        let call = Call::new_client(call_id, method.clone(), sink, deadline);

        {
            let mut table = self.table.lock().await;
            table.calls.insert(call_id, call.clone());
        }

        trace!(conn_id = self.id, call_id, method = %method, "begin");
        if let Err(err) = self
            .transport
            .write_packet(&self.ctx, codec::encode_frame(&frame::new_begin(call_id, method, proto_deadline))?)
            .await
        {
            self.table.lock().await.calls.remove(&call_id);
            if !error::is_recoverable(&err) {
                self.close().await;
            }
            return Err(err);
        }

        Ok(call)
    }

    /// Graceful shutdown: client writes SHUTDOWN, server writes GO_AWAY.
    /// In-flight calls are left to finish; new BEGINs are refused/ignored
    /// per role (see `begin` and the read loop's BEGIN handling).
    pub async fn shutdown(&self) {
        let target = match self.role {
            Role::Client => LifecycleState::ShuttingDown,
            Role::Server => LifecycleState::GoingAway,
        };
        let moved = {
            let mut state = self.state.lock().await;
            state.lifecycle.advance(target)
        };
        if !moved {
            return;
        }
        debug!(conn_id = self.id, role = ?self.role, ?target, "connection shutting down");
        match self.role {
            Role::Client => observer::dispatch_shutdown(&self.sinks, self.arc()),
            Role::Server => observer::dispatch_go_away(&self.sinks, self.arc()),
        }
        let frame = match self.role {
            Role::Client => frame::new_shutdown(),
            Role::Server => frame::new_go_away(),
        };
        if let Ok(bytes) = codec::encode_frame(&frame) {
            let _ = self.transport.write_packet(&self.ctx, bytes).await;
        }
    }

    /// Abrupt close: idempotently closes the transport, aborts every live
    /// call with a synthetic ABORTED status, and wakes observers of
    /// [`Conn::closed`].
    pub async fn close(&self) {
        let moved = {
            let mut state = self.state.lock().await;
            state.lifecycle.advance(LifecycleState::Closed)
        };
        if !moved {
            return;
        }
        debug!(conn_id = self.id, "connection closed");
        self.ctx.cancel();
        let _ = self.transport.close().await;

        let calls: Vec<ArcCall> = {
            let mut table = self.table.lock().await;
            table.calls.drain().map(|(_, call)| call).collect()
        };
        for call in calls {
            call.abort(Error::TransportClosed).await;
        }
        self.closed.notify_waiters();
        observer::dispatch_close(&self.sinks, self.arc());
    }

    async fn lookup(&self, call_id: u32) -> Option<ArcCall> {
        self.table.lock().await.calls.get(&call_id).cloned()
    }

    async fn dispatch_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let kind = frame::kind(&frame)?;
        match kind {
            FrameType::NoOp => Ok(()),
            FrameType::Shutdown => self.on_shutdown().await,
            FrameType::GoAway => self.on_go_away().await,
            FrameType::Begin => self.on_begin(frame).await,
            FrameType::Request => self.on_request(frame).await,
            FrameType::Response => self.on_response(frame).await,
            FrameType::HalfClose => self.on_half_close(frame).await,
            FrameType::Cancel => self.on_cancel(frame).await,
            FrameType::End => self.on_end(frame).await,
        }
    }

    async fn on_shutdown(self: &Arc<Self>) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::ProtocolViolation(Box::new(Error::Inappropriate(
                "SHUTDOWN is only valid on a server-role connection",
            ))));
        }
        let mut state = self.state.lock().await;
        state.lifecycle.advance(LifecycleState::ShuttingDown);
        drop(state);
        self.closed.notify_waiters();
        observer::dispatch_shutdown(&self.sinks, self.clone());
        Ok(())
    }

    async fn on_go_away(self: &Arc<Self>) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::ProtocolViolation(Box::new(Error::Inappropriate(
                "GO_AWAY is only valid on a client-role connection",
            ))));
        }
        let mut state = self.state.lock().await;
        state.lifecycle.advance(LifecycleState::GoingAway);
        drop(state);
        self.closed.notify_waiters();
        observer::dispatch_go_away(&self.sinks, self.clone());
        Ok(())
    }

    async fn on_begin(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let Some(router) = self.router.clone() else {
            return Err(Error::ProtocolViolation(Box::new(Error::Inappropriate(
                "BEGIN is only valid on a server-role connection",
            ))));
        };

        let lifecycle = self.lifecycle().await;
        if lifecycle >= LifecycleState::ShuttingDown {
            // Silent drop, per the spec's recorded Open Question decision.
            return Ok(());
        }

        let mut table = self.table.lock().await;
        if table.calls.contains_key(&frame.call_id) {
            return Err(Error::ProtocolViolation(Box::new(Error::DuplicateCall(frame.call_id))));
        }

        let deadline = frame.deadline.as_ref().map(call::timestamp_to_system_time);
        let sink: Arc<dyn FrameSink> = self.clone();
        let call = Call::new_server(frame.call_id, frame.method.clone(), sink, deadline);
        table.calls.insert(frame.call_id, call.clone());
        drop(table);

        trace!(conn_id = self.id, call_id = frame.call_id, method = %frame.method, "begin received");
        observer::dispatch_begin(&self.sinks, call.clone());
        match router::resolve(&router, &frame.method) {
            Ok(handler) => {
                tokio::spawn(router::dispatch(handler, call));
            }
            Err(err) => {
                let _ = call.end(error::status_from_error(&err)).await;
            }
        }
        Ok(())
    }

    async fn on_request(&self, frame: Frame) -> Result<()> {
        let Some(call) = self.lookup(frame.call_id).await else {
            return Ok(());
        };
        let payload = frame.payload.unwrap_or_default();
        observer::dispatch_request(&self.sinks, call.clone(), payload.clone());
        call.on_request(payload).await
    }

    async fn on_response(&self, frame: Frame) -> Result<()> {
        if let Some(call) = self.lookup(frame.call_id).await {
            let payload = frame.payload.unwrap_or_default();
            observer::dispatch_response(&self.sinks, call.clone(), payload.clone());
            call.on_response(payload).await;
        }
        Ok(())
    }

    async fn on_half_close(&self, frame: Frame) -> Result<()> {
        if let Some(call) = self.lookup(frame.call_id).await {
            observer::dispatch_half_close(&self.sinks, call.clone());
            call.on_half_close().await;
        }
        Ok(())
    }

    async fn on_cancel(&self, frame: Frame) -> Result<()> {
        if let Some(call) = self.lookup(frame.call_id).await {
            observer::dispatch_cancel(&self.sinks, call.clone());
            call.on_cancel().await;
        }
        Ok(())
    }

    async fn on_end(&self, frame: Frame) -> Result<()> {
        if let Some(call) = self.table.lock().await.calls.remove(&frame.call_id) {
            let status = frame::end_status(&frame);
            observer::dispatch_end(&self.sinks, call.clone(), status.clone());
            call.on_end(status).await;
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSink for Conn {
    async fn write_frame(&self, frame: Frame) -> Result<()> {
        let bytes = codec::encode_frame(&frame)?;
        match self.transport.write_packet(&self.ctx, bytes).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(conn_id = self.id, error = %err, "write failed");
                observer::dispatch_write_error(&self.sinks, self.arc(), err.to_string());
                if !error::is_recoverable(&err) {
                    self.close().await;
                }
                Err(err)
            }
        }
    }

    async fn call_closed(&self, call_id: u32) {
        self.table.lock().await.calls.remove(&call_id);
    }
}

fn spawn_read_loop(conn: Arc<Conn>) {
    tokio::spawn(async move {
        loop {
            let packet = match conn.transport.read_packet(&conn.ctx).await {
                Ok(packet) => packet,
                Err(err) => {
                    debug!(conn_id = conn.id, error = %err, "read loop terminating");
                    observer::dispatch_read_error(&conn.sinks, conn.clone(), err.to_string());
                    conn.close().await;
                    return;
                }
            };

            let frame = match codec::decode_frame(&packet.bytes) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(conn_id = conn.id, error = %err, "malformed frame, closing connection");
                    observer::dispatch_read_error(&conn.sinks, conn.clone(), err.to_string());
                    conn.close().await;
                    return;
                }
            };

            if let Err(err) = conn.dispatch_frame(frame).await {
                warn!(conn_id = conn.id, error = %err, "protocol violation, closing connection");
                conn.close().await;
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Any;
    use crate::status::StatusCode;
    use crate::testing::channel_pair;

    fn any(n: i32) -> Any {
        Any {
            type_url: "test".into(),
            value: vec![n as u8],
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl router::Handler for EchoHandler {
        async fn handle(&self, call: ArcCall) -> Result<()> {
            while let Some(payload) = call.recv().await {
                call.send(payload).await?;
            }
            Ok(())
        }
    }

    struct ForbiddenHandler;

    #[async_trait]
    impl router::Handler for ForbiddenHandler {
        async fn handle(&self, _call: ArcCall) -> Result<()> {
            Err(Error::status(Status::new(
                StatusCode::PermissionDenied,
                "permission denied for method \"bar.Forbidden\"",
            )))
        }
    }

    fn echo_router() -> Arc<Router> {
        let mut router = Router::new();
        router.register("foo.*", Arc::new(EchoHandler));
        router.register("bar.*", Arc::new(ForbiddenHandler));
        Arc::new(router)
    }

    #[tokio::test]
    async fn client_begin_then_server_echoes_request() {
        let (client_transport, server_transport) = channel_pair();
        let client = Conn::new_client(Arc::new(client_transport));
        let _server = Conn::new_server(Arc::new(server_transport), echo_router());

        let call = client.begin("foo.Echo", None).await.unwrap();
        call.send(any(7)).await.unwrap();
        call.close_send().await.unwrap();

        let got = call.recv().await;
        assert_eq!(got, Some(any(7)));
        assert_eq!(call.wait().await.code, StatusCode::Ok);
    }

    #[tokio::test]
    async fn unknown_method_ends_with_unimplemented() {
        let (client_transport, server_transport) = channel_pair();
        let client = Conn::new_client(Arc::new(client_transport));
        let _server = Conn::new_server(Arc::new(server_transport), echo_router());

        let call = client.begin("baz.Missing", None).await.unwrap();
        call.close_send().await.unwrap();
        let status = call.wait().await;
        assert_eq!(status.code, StatusCode::Unimplemented);
    }

    #[tokio::test]
    async fn forbidden_handler_status_propagates_to_client() {
        let (client_transport, server_transport) = channel_pair();
        let client = Conn::new_client(Arc::new(client_transport));
        let _server = Conn::new_server(Arc::new(server_transport), echo_router());

        let call = client.begin("bar.Forbidden", None).await.unwrap();
        call.close_send().await.unwrap();
        let status = call.wait().await;
        assert_eq!(status.code, StatusCode::PermissionDenied);
        assert_eq!(status.text, "permission denied for method \"bar.Forbidden\"");
    }

    #[tokio::test]
    async fn duplicate_begin_id_is_protocol_violation() {
        let (client_transport, server_transport) = channel_pair();
        let server_transport = Arc::new(server_transport);
        let server = Conn::new_server(server_transport.clone(), echo_router());

        // Write two BEGINs with the same call id directly on the client
        // side of the channel, bypassing id allocation.
        let client_transport = Arc::new(client_transport);
        let ctx = Context::new();
        let begin = frame::new_begin(1, "foo.Echo", None);
        client_transport
            .write_packet(&ctx, codec::encode_frame(&begin).unwrap())
            .await
            .unwrap();
        client_transport
            .write_packet(&ctx, codec::encode_frame(&begin).unwrap())
            .await
            .unwrap();

        server.closed().await;
    }

    #[tokio::test]
    async fn connection_close_aborts_live_calls() {
        let (client_transport, server_transport) = channel_pair();
        let client = Conn::new_client(Arc::new(client_transport));
        let _server = Conn::new_server(Arc::new(server_transport), echo_router());

        let call = client.begin("foo.Echo", None).await.unwrap();
        call.send(any(1)).await.unwrap();
        client.close().await;

        let status = call.wait().await;
        assert_eq!(status.code, StatusCode::Aborted);
    }

    #[derive(Default)]
    struct RecordingSink {
        begins: std::sync::Mutex<Vec<u32>>,
        ends: std::sync::Mutex<Vec<StatusCode>>,
        closes: std::sync::Mutex<u32>,
    }

    impl observer::EventSink for RecordingSink {
        fn on_begin(&self, call: ArcCall) {
            self.begins.lock().unwrap().push(call.call_id());
        }
        fn on_end(&self, _call: ArcCall, status: Status) {
            self.ends.lock().unwrap().push(status.code);
        }
        fn on_close(&self, _conn: ArcConn) {
            *self.closes.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn registered_sink_observes_begin_end_and_close() {
        let recorder = Arc::new(RecordingSink::default());
        let sink: ArcEventSink = recorder.clone();
        let (client_transport, server_transport) = channel_pair();
        let client = Conn::new_client(Arc::new(client_transport));
        let server_config = ConnConfig {
            sinks: vec![sink],
            ..ConnConfig::default()
        };
        let server = Conn::new_server_with_config(Arc::new(server_transport), echo_router(), server_config);

        let call = client.begin("foo.Echo", None).await.unwrap();
        call.close_send().await.unwrap();
        call.wait().await;
        server.close().await;

        for _ in 0..50 {
            if !recorder.begins.lock().unwrap().is_empty()
                && !recorder.ends.lock().unwrap().is_empty()
                && *recorder.closes.lock().unwrap() > 0
            {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*recorder.begins.lock().unwrap(), vec![1]);
        assert_eq!(*recorder.ends.lock().unwrap(), vec![StatusCode::Ok]);
        assert_eq!(*recorder.closes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn call_id_allocation_reuses_freed_slots_densely() {
        let mut table = Table::new();
        let a = table.allocate_id();
        table.calls.insert(a, dummy_call());
        let b = table.allocate_id();
        table.calls.insert(b, dummy_call());
        assert_eq!((a, b), (1, 2));

        table.calls.remove(&1);
        let c = table.allocate_id();
        assert_eq!(c, 3);
    }

    #[tokio::test]
    async fn call_id_allocation_reuses_the_most_recently_freed_id_immediately() {
        let mut table = Table::new();
        let a = table.allocate_id();
        table.calls.insert(a, dummy_call());
        let b = table.allocate_id();
        table.calls.insert(b, dummy_call());
        assert_eq!((a, b), (1, 2));

        // Freeing the most recently allocated id (not the oldest) lets the
        // very next allocation reuse it directly, without probing forward.
        table.calls.remove(&2);
        let c = table.allocate_id();
        assert_eq!(c, 2);
    }

    #[tokio::test]
    async fn with_config_carries_custom_inbound_queue_bound() {
        let (client_transport, server_transport) = channel_pair();
        let config = ConnConfig {
            inbound_queue_bound: 4,
            ..ConnConfig::default()
        };
        let client = Conn::new_client_with_config(Arc::new(client_transport), config.clone());
        let server = Conn::new_server_with_config(Arc::new(server_transport), echo_router(), config);
        assert_eq!(client.config().inbound_queue_bound, 4);
        assert_eq!(server.config().inbound_queue_bound, 4);
    }

    fn dummy_call() -> ArcCall {
        struct NullSink;
        #[async_trait]
        impl FrameSink for NullSink {
            async fn write_frame(&self, _frame: Frame) -> Result<()> {
                Ok(())
            }
            async fn call_closed(&self, _call_id: u32) {}
        }
        Call::new_client(2, "x".into(), Arc::new(NullSink), None)
    }
}
