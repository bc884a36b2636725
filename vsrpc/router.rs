//! Handler trait and method-name router.
//!
//! A [`Handler`] is dispatched exactly once per inbound BEGIN, in its own
//! task, with the [`Call`] as parameter (see [`crate::conn`] and
//! [`crate::server`]). [`Router`] resolves a dotted method name to a
//! registered handler with suffix-wildcard fallback.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::call::ArcCall;
use crate::error::{status_from_error, Error, Result};
use crate::status::Status;

/// An RPC service handler.
///
/// Implementations read requests via [`Call::recv`](crate::call::Call::recv)
/// and write responses via [`Call::send`](crate::call::Call::send); they do
/// not call [`Call::end`](crate::call::Call::end) themselves except to
/// short-circuit with a specific status — the dispatcher ends the call with
/// the handler's returned status once `handle` resolves.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, call: ArcCall) -> Result<()>;
}

pub type ArcHandler = Arc<dyn Handler>;

/// A mapping from dotted method name to handler, with suffix-wildcard
/// fallback: `foo.bar.Baz` resolves, in order, `foo.bar.Baz`, `foo.bar.*`,
/// `foo.*`, `*`.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, ArcHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `method`, which may be an exact method
    /// name or end in `.*`/`*` to serve as a prefix fallback.
    pub fn register(&mut self, method: impl Into<String>, handler: ArcHandler) {
        self.routes.insert(method.into(), handler);
    }

    /// Resolves `method` to a handler, or `None` if no exact match or
    /// wildcard prefix is registered.
    pub fn route(&self, method: &str) -> Option<ArcHandler> {
        if let Some(handler) = self.routes.get(method) {
            return Some(handler.clone());
        }

        let mut prefix = method;
        while let Some(idx) = prefix.rfind('.') {
            prefix = &prefix[..idx];
            if let Some(handler) = self.routes.get(&format!("{prefix}.*")) {
                return Some(handler.clone());
            }
        }

        self.routes.get("*").cloned()
    }
}

/// Runs `handler` against `call`, converts its outcome to a [`Status`], and
/// ends the call with it. A handler panic is captured and converted the
/// same way a returned error would be; a handler that already ended the
/// call itself (e.g. to short-circuit with a specific status) makes this a
/// no-op, since [`Call::end`](crate::call::Call::end) is idempotent once
/// closed.
pub async fn dispatch(handler: ArcHandler, call: ArcCall) {
    let outcome = std::panic::AssertUnwindSafe(handler.handle(call.clone()))
        .catch_unwind()
        .await;

    let status = match outcome {
        Ok(Ok(())) => Status::ok(),
        Ok(Err(err)) => status_from_error(&err),
        Err(panic) => {
            let message = panic_message(&panic);
            status_from_error(&Error::Panic(message))
        }
    };

    let _ = call.end(status).await;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Looks up `method` in `router`, returning an `UNIMPLEMENTED` error if no
/// handler (exact, wildcard, or catch-all) resolves it.
pub fn resolve(router: &Router, method: &str) -> Result<ArcHandler> {
    router
        .route(method)
        .ok_or_else(|| Error::NoSuchMethod(method.to_string()))
}
