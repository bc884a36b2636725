//! Cancellation context shared by calls, connections, and endpoints.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A cancellation context, wrapping a `CancellationToken`.
///
/// Every [`crate::call::Call`] carries two of these: an outer context used
/// for writes (so a locally-cancelled call can still write CANCEL) and an
/// inner context that is cancelled when the call reaches its terminal state
/// by any path and is exposed to user handlers.
///
/// # Example
///
/// ```rust,ignore
/// let ctx = Context::new();
///
/// if ctx.is_cancelled() {
///     return Err(Error::Cancelled);
/// }
///
/// let child = ctx.child();
/// ctx.cancel();
/// ```
#[derive(Debug, Clone)]
pub struct Context {
    cancel_token: CancellationToken,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a new, unlinked context.
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
        }
    }

    /// Wraps an existing cancellation token.
    pub fn with_cancel_token(cancel_token: CancellationToken) -> Self {
        Self { cancel_token }
    }

    /// Creates a child context that is cancelled whenever the parent is.
    pub fn child(&self) -> Self {
        Self {
            cancel_token: self.cancel_token.child_token(),
        }
    }

    /// Returns the underlying cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Cancels this context and every child derived from it.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Returns true if this context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Waits until this context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await
    }

    /// Returns an owned future that completes when the context is cancelled.
    pub fn cancellation(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let token = self.cancel_token.clone();
        async move {
            token.cancelled().await;
        }
    }
}

/// A reference-counted [`Context`], for sharing a cancellation boundary
/// across tasks without cloning the token repeatedly by hand.
pub type ArcContext = Arc<Context>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_is_not_cancelled() {
        let ctx = Context::new();
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn cancel_marks_cancelled() {
        let ctx = Context::new();
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn child_is_cancelled_with_parent() {
        let parent = Context::new();
        let child = parent.child();

        assert!(!parent.is_cancelled());
        assert!(!child.is_cancelled());

        parent.cancel();

        assert!(parent.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancelling_child_does_not_cancel_parent() {
        let parent = Context::new();
        let child = parent.child();

        child.cancel();

        assert!(!parent.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_after_cancel() {
        let ctx = Context::new();

        let ctx_clone = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            ctx_clone.cancel();
        });

        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
