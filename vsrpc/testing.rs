//! Test-only in-process transport and canned handlers.
//!
//! [`channel_pair`] builds two connected [`PacketConnection`]s over
//! `tokio::sync::mpsc` channels, message-oriented exactly like a real
//! datagram carrier would be, so the rest of the crate's unit and
//! integration tests never need an actual socket. The handlers below back
//! the end-to-end scenarios exercised in `tests/integration_test.rs`.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::call::ArcCall;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::proto::Any;
use crate::router::Handler;
use crate::status::Status;
use crate::transport::{PacketConnection, ReceivedPacket};

/// One end of an in-process channel pair.
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

/// Builds two connected, message-oriented transports: writes on one side
/// arrive as reads on the other, in order, with no framing overhead.
pub fn channel_pair() -> (ChannelTransport, ChannelTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            outbound: a_tx,
            inbound: Mutex::new(b_rx),
        },
        ChannelTransport {
            outbound: b_tx,
            inbound: Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl PacketConnection for ChannelTransport {
    async fn read_packet(&self, ctx: &Context) -> Result<ReceivedPacket> {
        tokio::select! {
            packet = async { self.inbound.lock().await.recv().await } => {
                packet.map(ReceivedPacket::new).ok_or(Error::TransportClosed)
            }
            _ = ctx.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn write_packet(&self, ctx: &Context, bytes: Bytes) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.outbound.send(bytes).map_err(|_| Error::TransportClosed)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn decode_sum_request(payload: &Any) -> Vec<i32> {
    payload.value.iter().map(|&b| b as i32).collect()
}

fn encode_sum_response(sum: i32) -> Any {
    Any {
        type_url: "type.example/vsrpc.testing.SumResponse".into(),
        value: vec![sum as u8],
    }
}

/// A handler that drains its inbound requests, acknowledges nothing, and
/// ends OK. Backs the `AlwaysOK` end-to-end scenario.
pub struct AlwaysOkHandler;

#[async_trait]
impl Handler for AlwaysOkHandler {
    async fn handle(&self, call: ArcCall) -> Result<()> {
        while call.recv().await.is_some() {}
        Ok(())
    }
}

/// A handler that sums each request's `int32[]` payload (encoded here as
/// one byte per element) and responds once per request. Backs the `SumOne`
/// and `SumThree` end-to-end scenarios.
pub struct SumHandler;

#[async_trait]
impl Handler for SumHandler {
    async fn handle(&self, call: ArcCall) -> Result<()> {
        while let Some(payload) = call.recv().await {
            let sum: i32 = decode_sum_request(&payload).into_iter().sum();
            call.send(encode_sum_response(sum)).await?;
        }
        Ok(())
    }
}

/// A handler that always fails with `PERMISSION_DENIED`. Backs the
/// `Forbidden` end-to-end scenario.
pub struct ForbiddenHandler;

#[async_trait]
impl Handler for ForbiddenHandler {
    async fn handle(&self, _call: ArcCall) -> Result<()> {
        Err(Error::status(Status::new(
            crate::status::StatusCode::PermissionDenied,
            "permission denied for method \"bar.Forbidden\"",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_pair_delivers_in_order() {
        let (a, b) = channel_pair();
        let ctx = Context::new();
        a.write_packet(&ctx, Bytes::from_static(b"one")).await.unwrap();
        a.write_packet(&ctx, Bytes::from_static(b"two")).await.unwrap();

        let first = b.read_packet(&ctx).await.unwrap();
        let second = b.read_packet(&ctx).await.unwrap();
        assert_eq!(&first.bytes[..], b"one");
        assert_eq!(&second.bytes[..], b"two");
    }

    #[tokio::test]
    async fn read_after_drop_returns_transport_closed() {
        let (a, b) = channel_pair();
        drop(a);
        let ctx = Context::new();
        let err = b.read_packet(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
    }

    #[tokio::test]
    async fn sum_handler_sums_request_payload() {
        let request = decode_sum_request(&Any {
            type_url: "x".into(),
            value: vec![1, 2, 3, 4, 5],
        });
        assert_eq!(request.into_iter().sum::<i32>(), 15);
    }
}
