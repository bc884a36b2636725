//! The client endpoint: owns a set of outbound connections.
//!
//! A [`ClientEndpoint`] wraps a [`PacketDialer`] and keeps every connection
//! it dials alive in a registry, pruning each one automatically once it
//! reaches [`LifecycleState::Closed`]. [`Picker`] is the seam for
//! load-balancing strategies across that registry; concrete strategies are
//! out of scope here (see SPEC_FULL.md §1's Non-goals).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::conn::{ArcConn, Conn, ConnConfig};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleState;
use crate::observer::{self, ArcEventSink};
use crate::transport::{PacketConnection, PacketDialer, TransportConfig};

/// Client-endpoint tunables.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    /// How long `shutdown` waits for owned connections to drain before the
    /// caller should consider falling back to `close`.
    pub shutdown_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Selects one connection from a live snapshot, e.g. round-robin or
/// least-loaded. No concrete strategy ships in this crate.
pub trait Picker: Send + Sync {
    fn pick(&self, conns: &[ArcConn]) -> Option<ArcConn>;
}

/// Always picks the first live connection; used by tests and as a trivial
/// default for single-connection clients.
pub struct FirstPicker;

impl Picker for FirstPicker {
    fn pick(&self, conns: &[ArcConn]) -> Option<ArcConn> {
        conns.first().cloned()
    }
}

struct ClientState {
    lifecycle: LifecycleState,
}

/// Owns every connection this client has dialed.
pub struct ClientEndpoint {
    dialer: Arc<dyn PacketDialer>,
    config: ClientConfig,
    conns: Mutex<Vec<ArcConn>>,
    state: Mutex<ClientState>,
    sinks: Vec<ArcEventSink>,
}

pub type ArcClientEndpoint = Arc<ClientEndpoint>;

impl ClientEndpoint {
    pub fn new(dialer: Arc<dyn PacketDialer>) -> Arc<Self> {
        Self::with_config(dialer, ClientConfig::default())
    }

    pub fn with_config(dialer: Arc<dyn PacketDialer>, config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            config,
            conns: Mutex::new(Vec::new()),
            state: Mutex::new(ClientState {
                lifecycle: LifecycleState::Running,
            }),
            sinks: Vec::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Registers an event sink, notified of this endpoint's dial events and
    /// threaded into every connection it creates.
    pub fn with_sink(mut self: Arc<Self>, sink: ArcEventSink) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_sink must be called before the endpoint is shared")
            .sinks
            .push(sink);
        self
    }

    async fn lifecycle(&self) -> LifecycleState {
        self.state.lock().await.lifecycle
    }

    async fn check_open(&self) -> Result<()> {
        match self.lifecycle().await {
            LifecycleState::Closed => Err(Error::ClientClosed),
            lc if lc >= LifecycleState::ShuttingDown => Err(Error::ClientShuttingDown),
            _ => Ok(()),
        }
    }

    /// Dials `addr` via the configured [`PacketDialer`] and registers the
    /// resulting connection.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> Result<ArcConn> {
        self.check_open().await?;
        let ctx = Context::new();
        let pc = match self.dialer.dial(&ctx, addr).await {
            Ok(pc) => pc,
            Err(err) => {
                observer::dispatch_dial_error(&self.sinks, err.to_string());
                return Err(err);
            }
        };
        self.dial_existing(pc).await
    }

    /// Registers a caller-provided transport as a new client-role
    /// connection, skipping the dialer.
    pub async fn dial_existing(self: &Arc<Self>, pc: Arc<dyn PacketConnection>) -> Result<ArcConn> {
        self.check_open().await?;
        let config = ConnConfig {
            sinks: self.sinks.clone(),
            ..ConnConfig::default()
        };
        let conn = Conn::new_client_with_config(pc, config);
        observer::dispatch_dial(&self.sinks, conn.clone());
        self.conns.lock().await.push(conn.clone());
        spawn_reaper(self.clone(), conn.clone());
        Ok(conn)
    }

    /// Snapshots the live connection set and delegates selection to `picker`.
    pub async fn pick(&self, picker: &dyn Picker) -> Option<ArcConn> {
        let snapshot = self.conns.lock().await.clone();
        picker.pick(&snapshot)
    }

    /// Graceful shutdown: advances to ShuttingDown and requests a graceful
    /// shutdown of every owned connection, best-effort.
    pub async fn shutdown(&self) {
        let moved = {
            let mut state = self.state.lock().await;
            state.lifecycle.advance(LifecycleState::ShuttingDown)
        };
        if !moved {
            return;
        }
        let snapshot = self.conns.lock().await.clone();
        for conn in snapshot {
            conn.shutdown().await;
        }
    }

    /// Abrupt close: advances to Closed and force-closes every owned
    /// connection.
    pub async fn close(&self) {
        let moved = {
            let mut state = self.state.lock().await;
            state.lifecycle.advance(LifecycleState::Closed)
        };
        if !moved {
            return;
        }
        let conns = std::mem::take(&mut *self.conns.lock().await);
        for conn in conns {
            conn.close().await;
        }
    }
}

fn spawn_reaper(endpoint: Arc<ClientEndpoint>, conn: ArcConn) {
    tokio::spawn(async move {
        conn.closed().await;
        endpoint.conns.lock().await.retain(|c| c.id() != conn.id());
    });
}
