use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;

use crate::metadata::Metadata;

/// Why a [`CallContext`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Per-call carrier of deadline, cancellation and request metadata.
///
/// Contexts form a tree: [`with_timeout`](Self::with_timeout) and
/// [`child`](Self::child) derive a narrower context whose deadline is never later than
/// its parent's and which is cancelled whenever its parent is. Cancelling a child leaves
/// the parent untouched.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    token: CancellationToken,
    metadata: Metadata,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    /// A root context with no deadline.
    pub fn new() -> Self {
        Self {
            deadline: None,
            token: CancellationToken::new(),
            metadata: Metadata::new(),
        }
    }

    /// Derives a child that can be cancelled independently of `self`.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
            metadata: self.metadata.clone(),
        }
    }

    /// Derives a child whose deadline is the tighter of `self`'s and `now + timeout`.
    ///
    /// A timeout too large to express as an instant adds no deadline of its own.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        }
    }

    /// Derives a child whose deadline is the tighter of `self`'s and `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        });
        child
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Why the context ended, or `None` while it is still live.
    ///
    /// Cancellation is reported in preference to an elapsed deadline.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            Some(ContextError::Cancelled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => ContextError::Cancelled,
                    _ = sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Drives `fut` until it completes or the context ends, whichever comes first.
    ///
    /// An already-ended context returns without polling `fut`.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Looks up a metadata value.
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key)
    }

    /// Returns the context with `key` set to `value`.
    pub fn set_metadata(mut self, key: &str, value: impl AsRef<[u8]>) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unbounded_timeout_keeps_the_parent_deadline() {
        let root = CallContext::new().with_timeout(Duration::MAX);
        assert_eq!(root.deadline(), None);
        assert_eq!(root.err(), None);

        let parent = CallContext::new().with_timeout(Duration::from_secs(5));
        let child = parent.with_timeout(Duration::MAX);
        assert_eq!(child.deadline(), parent.deadline());
        parent.cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn child_deadline_never_exceeds_parent() {
        let parent = CallContext::new().with_timeout(Duration::from_millis(100));

        let longer = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(longer.deadline(), parent.deadline());

        let shorter = parent.with_timeout(Duration::from_millis(10));
        assert!(shorter.deadline() < parent.deadline());

        assert_eq!(shorter.done().await, ContextError::DeadlineExceeded);
        assert_eq!(shorter.err(), Some(ContextError::DeadlineExceeded));
        assert_eq!(parent.err(), None);
    }

    #[tokio::test]
    async fn cancellation_flows_down_not_up() {
        let parent = CallContext::new();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));
        assert_eq!(parent.err(), None);
        assert_eq!(sibling.err(), None);

        parent.cancel();
        assert_eq!(sibling.done().await, ContextError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn run_is_bounded_by_the_context() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));

        let fast = ctx.run(async { 7 }).await;
        assert_eq!(fast, Ok(7));

        let slow = ctx
            .run(tokio::time::sleep(Duration::from_secs(1)))
            .await;
        assert_eq!(slow, Err(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn run_skips_work_on_a_finished_context() {
        let ctx = CallContext::new();
        ctx.cancel();

        let out = ctx.run(async { panic!("must not be polled") }).await;
        assert_eq!(out, Err(ContextError::Cancelled));
    }

    #[test]
    fn metadata_is_inherited_by_children() {
        let parent = CallContext::new().set_metadata("X-User", "alice");
        let child = parent.child().set_metadata("x-retry-attempt", "1");

        assert_eq!(child.get_metadata("x-user"), Some("alice"));
        assert_eq!(child.get_metadata("x-retry-attempt"), Some("1"));
        assert_eq!(parent.get_metadata("x-retry-attempt"), None);
    }
}
