//! The server endpoint: owns a listener and a set of inbound connections.
//!
//! A [`ServerEndpoint`] accepts [`PacketConnection`]s from a
//! [`PacketListener`], wraps each as a server-role [`Conn`] bound to a
//! shared [`Router`], and reaps the connection once it closes — the
//! server-side mirror of [`crate::client::ClientEndpoint`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::warn;

use crate::conn::{ArcConn, Conn, ConnConfig};
use crate::context::Context;
use crate::error::Error;
use crate::lifecycle::LifecycleState;
use crate::observer::{self, ArcEventSink};
use crate::router::Router;
use crate::transport::{PacketConnection, PacketListener, TransportConfig};

/// Server-endpoint tunables.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub transport: TransportConfig,
    /// How long a graceful `shutdown` waits for in-flight calls to finish
    /// before the caller should consider falling back to `close`.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

struct ServerState {
    lifecycle: LifecycleState,
}

/// Accepts connections from a listener and dispatches inbound calls to a
/// shared [`Router`].
pub struct ServerEndpoint {
    listener: Arc<dyn PacketListener>,
    router: Arc<Router>,
    config: ServerConfig,
    conns: Mutex<Vec<ArcConn>>,
    state: Mutex<ServerState>,
    error_handler: Option<Arc<dyn Fn(Error) + Send + Sync>>,
    sinks: Vec<ArcEventSink>,
}

impl ServerEndpoint {
    pub fn new(listener: Arc<dyn PacketListener>, router: Arc<Router>) -> Arc<Self> {
        Self::with_config(listener, router, ServerConfig::default())
    }

    pub fn with_config(listener: Arc<dyn PacketListener>, router: Arc<Router>, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            listener,
            router,
            config,
            conns: Mutex::new(Vec::new()),
            state: Mutex::new(ServerState {
                lifecycle: LifecycleState::Running,
            }),
            error_handler: None,
            sinks: Vec::new(),
        })
    }

    /// Installs a callback invoked (outside any internal lock) whenever
    /// accepting a connection fails. Logging/metrics only; does not affect
    /// the accept loop's control flow.
    pub fn with_error_handler<F>(mut self: Arc<Self>, handler: F) -> Arc<Self>
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        Arc::get_mut(&mut self)
            .expect("with_error_handler must be called before the endpoint is shared")
            .error_handler = Some(Arc::new(handler));
        self
    }

    /// Registers an event sink, notified of this endpoint's accept events
    /// and threaded into every connection it creates.
    pub fn with_sink(mut self: Arc<Self>, sink: ArcEventSink) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_sink must be called before the endpoint is shared")
            .sinks
            .push(sink);
        self
    }

    fn report_error(&self, err: Error) {
        if let Some(handler) = &self.error_handler {
            handler(err);
        }
    }

    async fn lifecycle(&self) -> LifecycleState {
        self.state.lock().await.lifecycle
    }

    /// Runs the accept loop until the listener is closed or the endpoint is
    /// shut down; each accepted connection becomes a server-role [`Conn`].
    pub async fn serve(self: &Arc<Self>) {
        let ctx = Context::new();
        loop {
            if self.lifecycle().await != LifecycleState::Running {
                return;
            }
            match self.listener.accept(&ctx).await {
                Ok(pc) => self.accept_connection(pc).await,
                Err(Error::TransportClosed) => return,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    observer::dispatch_accept_error(&self.sinks, err.to_string());
                    self.report_error(err);
                }
            }
        }
    }

    async fn accept_connection(self: &Arc<Self>, pc: Arc<dyn PacketConnection>) {
        let config = ConnConfig {
            sinks: self.sinks.clone(),
            ..ConnConfig::default()
        };
        let conn = Conn::new_server_with_config(pc, self.router.clone(), config);
        observer::dispatch_accept(&self.sinks, conn.clone());
        self.conns.lock().await.push(conn.clone());
        spawn_reaper(self.clone(), conn);
    }

    /// Graceful shutdown: stops accepting new connections and requests a
    /// graceful shutdown (GO_AWAY) of every live connection, letting
    /// in-flight calls finish.
    pub async fn shutdown(&self) {
        let moved = {
            let mut state = self.state.lock().await;
            state.lifecycle.advance(LifecycleState::ShuttingDown)
        };
        if !moved {
            return;
        }
        let _ = self.listener.close().await;
        let snapshot = self.conns.lock().await.clone();
        for conn in snapshot {
            conn.shutdown().await;
        }
    }

    /// Abrupt close: closes the listener (if still open) and force-closes
    /// every live connection.
    pub async fn close(&self) {
        let moved = {
            let mut state = self.state.lock().await;
            state.lifecycle.advance(LifecycleState::Closed)
        };
        if !moved {
            return;
        }
        let _ = self.listener.close().await;
        let conns = std::mem::take(&mut *self.conns.lock().await);
        for conn in conns {
            conn.close().await;
        }
    }
}

fn spawn_reaper(server: Arc<ServerEndpoint>, conn: ArcConn) {
    tokio::spawn(async move {
        conn.closed().await;
        server.conns.lock().await.retain(|c| c.id() != conn.id());
    });
}
