//! Caller context for blocking matcher operations
//!
//! Every suspension point in the matcher observes a [`MatchContext`]: an
//! explicit cancellation token plus an optional deadline. Poll requests also
//! carry the poller identity forwarded to the parent partition.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::MatchError;

/// Cancellation scope for one matcher call
///
/// # Example
///
/// ```
/// use everruns_matching::MatchContext;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let ctx = MatchContext::with_timeout(Duration::from_secs(1))
///     .with_poller("poller-1", "worker@host");
/// assert!(ctx.err().is_none());
/// ctx.cancel();
/// assert!(ctx.err().is_some());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MatchContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    poller_id: Option<String>,
    identity: Option<String>,
    forwarded_from: Option<String>,
}

impl Default for MatchContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchContext {
    /// Create a context without a deadline
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            poller_id: None,
            identity: None,
            forwarded_from: None,
        }
    }

    /// Create a context that expires after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline_at(Instant::now() + timeout)
    }

    /// Set an absolute deadline, keeping an earlier one if present
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Attach the poller identity sent along with forwarded polls
    pub fn with_poller(mut self, poller_id: impl Into<String>, identity: impl Into<String>) -> Self {
        self.poller_id = Some(poller_id.into());
        self.identity = Some(identity.into());
        self
    }

    /// Mark the call as arriving from a child partition; such calls are
    /// answered locally and never forwarded again
    pub fn with_forwarded_from(mut self, partition: impl Into<String>) -> Self {
        self.forwarded_from = Some(partition.into());
        self
    }

    /// Derive a context that is canceled with this one and expires after
    /// `timeout` at the latest
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            poller_id: self.poller_id.clone(),
            identity: self.identity.clone(),
            forwarded_from: self.forwarded_from.clone(),
        }
        .deadline_at(Instant::now() + timeout)
    }

    /// Cancel this context and all children
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Underlying cancellation token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Poller id for forwarded polls
    pub fn poller_id(&self) -> Option<&str> {
        self.poller_id.as_deref()
    }

    /// Poller identity for forwarded polls
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Child partition the call was forwarded from
    pub fn forwarded_from(&self) -> Option<&str> {
        self.forwarded_from.as_deref()
    }

    /// Error describing why this context is done, if it is
    pub fn err(&self) -> Option<MatchError> {
        if self.token.is_cancelled() {
            return Some(MatchError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(MatchError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Whether the context is canceled or expired
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve once the context is canceled or its deadline passes
    pub async fn done(&self) -> MatchError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => MatchError::Canceled,
                _ = tokio::time::sleep_until(deadline) => MatchError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                MatchError::Canceled
            }
        }
    }
}
