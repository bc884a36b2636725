//! Abstract packet transport interface.
//!
//! The core depends only on this narrow, message-oriented contract rather
//! than on `AsyncRead`/`AsyncWrite` byte streams: `read_packet`/
//! `write_packet` each move exactly one whole message, with no framing of
//! their own, so any carrier that preserves message boundaries (a UNIX
//! seqpacket socket being the canonical one) can implement it. No concrete
//! carrier lives in this module; see [`crate::testing`] for the in-process
//! reference pair used by this crate's own tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::Context;
use crate::error::{Error, Result};

/// Default maximum packet size a transport is expected to enforce (16 MiB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Transport-level tunables: packet size cap and I/O timeout defaults.
///
/// A context deadline, when present, is combined with these by taking
/// whichever is earlier.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_packet_size: usize,
    pub accept_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            accept_timeout: None,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }
}

/// A received packet together with the handle that returns its backing
/// buffer to the transport's pool when dropped.
///
/// Carriers that do not pool buffers may simply omit a disposer; dropping a
/// `ReceivedPacket` with no disposer is a no-op.
pub struct ReceivedPacket {
    pub bytes: Bytes,
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for ReceivedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedPacket").field("bytes", &self.bytes).finish_non_exhaustive()
    }
}

impl ReceivedPacket {
    /// Wraps a packet with no pooled buffer to release.
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            dispose: None,
        }
    }

    /// Wraps a packet whose backing buffer should be released via `dispose`
    /// once the caller is done with `bytes`.
    pub fn with_dispose(bytes: Bytes, dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            bytes,
            dispose: Some(Box::new(dispose)),
        }
    }
}

impl Drop for ReceivedPacket {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

/// A single message-oriented connection: reads and writes whole packets.
///
/// `close` is idempotent and unblocks any in-flight read/write with
/// [`Error::TransportClosed`].
#[async_trait]
pub trait PacketConnection: Send + Sync {
    /// Reads one complete message, honoring cancellation of `ctx`.
    async fn read_packet(&self, ctx: &Context) -> Result<ReceivedPacket>;

    /// Writes one complete message atomically, honoring cancellation of `ctx`.
    async fn write_packet(&self, ctx: &Context, bytes: Bytes) -> Result<()>;

    /// Idempotently closes the connection.
    async fn close(&self) -> Result<()>;
}

/// Produces a [`PacketConnection`] given an address.
#[async_trait]
pub trait PacketDialer: Send + Sync {
    async fn dial(&self, ctx: &Context, addr: &str) -> Result<Arc<dyn PacketConnection>>;
}

/// Accepts inbound [`PacketConnection`]s.
#[async_trait]
pub trait PacketListener: Send + Sync {
    async fn accept(&self, ctx: &Context) -> Result<Arc<dyn PacketConnection>>;

    /// Idempotently stops accepting new connections.
    async fn close(&self) -> Result<()>;
}

/// Races a cancellable operation against `ctx`, returning
/// [`Error::Cancelled`] if the context is cancelled first.
pub async fn with_cancellation<T, F>(ctx: &Context, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        result = fut => result,
        _ = ctx.cancelled() => Err(Error::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_16_mib_cap() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.max_packet_size, 16 * 1024 * 1024);
        assert!(cfg.read_timeout.is_none());
    }

    #[test]
    fn builder_methods_set_fields() {
        let cfg = TransportConfig::new()
            .with_max_packet_size(1024)
            .with_read_timeout(Duration::from_secs(1));
        assert_eq!(cfg.max_packet_size, 1024);
        assert_eq!(cfg.read_timeout, Some(Duration::from_secs(1)));
    }

    #[test]
    fn received_packet_runs_dispose_on_drop() {
        let disposed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = disposed.clone();
        {
            let _packet =
                ReceivedPacket::with_dispose(Bytes::from_static(b"x"), move || {
                    flag.store(true, std::sync::atomic::Ordering::SeqCst);
                });
        }
        assert!(disposed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn with_cancellation_returns_cancelled_error() {
        let ctx = Context::new();
        ctx.cancel();
        let result: Result<()> =
            with_cancellation(&ctx, std::future::pending::<Result<()>>()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
