//! vsrpc - Very Simple RPC
//!
//! A bidirectional, multiplexed, streaming RPC protocol engine layered atop
//! a reliable, message-boundary-preserving transport. The wire protocol is a
//! single `Frame` message (see [`proto`]/[`frame`]); connections demultiplex
//! frames to per-call state machines ([`call`]) by call id ([`conn`]); calls
//! are dispatched to handlers by dotted method name ([`router`]).
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vsrpc::client::ClientEndpoint;
//! use vsrpc::router::Router;
//! use vsrpc::server::ServerEndpoint;
//!
//! // Server side: register handlers, accept connections.
//! let mut router = Router::new();
//! router.register("greeter.*", my_handler);
//! let server = ServerEndpoint::new(listener, Arc::new(router));
//! tokio::spawn(async move { server.serve().await });
//!
//! // Client side: dial, begin a call, exchange frames.
//! let client = ClientEndpoint::new(dialer);
//! let conn = client.dial("example").await?;
//! let call = conn.begin("greeter.Hello", None).await?;
//! call.send(request_payload).await?;
//! call.close_send().await?;
//! let response = call.recv().await;
//! let status = call.wait().await;
//! ```
//!
//! The transport itself (the carrier implementing [`transport::PacketConnection`]/
//! [`transport::PacketDialer`]/[`transport::PacketListener`]) is deliberately not
//! shipped here; [`testing::channel_pair`] is an in-process reference used by this
//! crate's own tests.

pub mod call;
pub mod client;
pub mod codec;
pub mod conn;
pub mod context;
pub mod error;
pub mod frame;
pub mod lifecycle;
pub mod observer;
pub mod proto;
pub mod queue;
pub mod router;
pub mod server;
pub mod status;
pub mod testing;
pub mod transport;

pub use call::{ArcCall, Call, Role};
pub use client::{ClientConfig, ClientEndpoint, Picker};
pub use conn::{ArcConn, Conn, ConnConfig};
pub use error::{Error, Result};
pub use observer::{ArcEventSink, EventSink};
pub use router::{ArcHandler, Handler, Router};
pub use server::{ServerConfig, ServerEndpoint};
pub use status::{Status, StatusCode};
pub use transport::{PacketConnection, PacketDialer, PacketListener, TransportConfig};

// Re-export for use by generated handler code working with raw payloads.
pub use async_trait::async_trait;
pub use prost::Message as ProstMessage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::call::{ArcCall, Call, Role};
    pub use crate::client::{ClientConfig, ClientEndpoint, Picker};
    pub use crate::conn::{ArcConn, Conn, ConnConfig};
    pub use crate::error::{Error, Result};
    pub use crate::observer::{ArcEventSink, EventSink};
    pub use crate::router::{ArcHandler, Handler, Router};
    pub use crate::server::{ServerConfig, ServerEndpoint};
    pub use crate::status::{Status, StatusCode};
    pub use crate::transport::{PacketConnection, PacketDialer, PacketListener, TransportConfig};

    pub use async_trait::async_trait;
    pub use prost::Message as ProstMessage;
}
