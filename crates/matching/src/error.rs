//! Matcher error types

use crate::config::ConfigError;
use crate::task::TaskError;
use crate::transport::TransportError;

/// Errors returned by the matcher and the forwarder
///
/// "No pairing happened" is not an error: [`TaskMatcher::offer`] reports it
/// as [`OfferOutcome::Unmatched`].
///
/// [`TaskMatcher::offer`]: crate::TaskMatcher::offer
/// [`OfferOutcome::Unmatched`]: crate::OfferOutcome::Unmatched
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    /// Caller canceled the operation
    #[error("operation canceled")]
    Canceled,

    /// Caller deadline passed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Forwarding was rejected by the local rate limiter or throttled by the parent
    #[error("forwarder rate limit exceeded")]
    ForwarderSlowDown,

    /// Partition has no parent to forward to
    #[error("root partition has no parent")]
    NoParent,

    /// Queue kind does not support forwarding
    #[error("forwarding is not supported on sticky task queues")]
    ForwardingUnsupported,

    /// Attempt to forward something that already crossed a partition boundary
    #[error("already forwarded from {0}; forwarding is single-hop")]
    AlreadyForwarded(String),

    /// Parent partition answered a forwarded poll without a task
    #[error("no tasks available")]
    NoTasks,

    /// Parent partition had no poller for a forwarded task
    #[error("remote sync match failed")]
    RemoteSyncMatchFailed,

    /// Operation was given the wrong kind of task (query vs task)
    #[error("task kind not accepted by this operation")]
    InvalidTaskKind,

    /// Transport to the parent partition failed
    #[error("transport error: {0}")]
    Transport(#[source] TransportError),

    /// Poller answered a query with an error
    #[error("query task failed: {0}")]
    Task(#[from] TaskError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl MatchError {
    /// Whether the error comes from the caller's context
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }

    /// Whether the error means "try again later / fall back to the backlog"
    pub fn is_throttle(&self) -> bool {
        matches!(self, Self::ForwarderSlowDown)
    }

    /// Whether a forward attempt completed without pairing anything
    pub(crate) fn is_not_matched(&self) -> bool {
        matches!(
            self,
            Self::ForwarderSlowDown | Self::RemoteSyncMatchFailed | Self::NoTasks
        )
    }

    /// Whether a forward attempt could not be made at all for this partition
    pub(crate) fn is_not_forwardable(&self) -> bool {
        matches!(
            self,
            Self::NoParent | Self::ForwardingUnsupported | Self::AlreadyForwarded(_)
        )
    }
}

impl From<TransportError> for MatchError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ResourceExhausted(_) => Self::ForwarderSlowDown,
            TransportError::Canceled => Self::Canceled,
            TransportError::DeadlineExceeded => Self::DeadlineExceeded,
            TransportError::SyncMatchFailed => Self::RemoteSyncMatchFailed,
            other => Self::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttling_maps_to_slow_down() {
        let err = MatchError::from(TransportError::ResourceExhausted("busy".into()));
        assert!(err.is_throttle());
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_transport_cancellation_stays_distinct() {
        assert!(MatchError::from(TransportError::Canceled).is_cancellation());
        assert!(MatchError::from(TransportError::DeadlineExceeded).is_cancellation());

        let err = MatchError::from(TransportError::Unavailable("connection refused".into()));
        assert!(matches!(err, MatchError::Transport(_)));
        assert!(!err.is_cancellation());
        assert!(!err.is_throttle());
    }

    #[test]
    fn test_remote_sync_match_failure_is_not_matched() {
        let err = MatchError::from(TransportError::SyncMatchFailed);
        assert!(matches!(err, MatchError::RemoteSyncMatchFailed));
        assert!(err.is_not_matched());
        assert!(MatchError::NoTasks.is_not_matched());
        assert!(!MatchError::NoParent.is_not_matched());
        assert!(MatchError::NoParent.is_not_forwardable());
    }

    #[test]
    fn test_display() {
        assert_eq!(MatchError::Canceled.to_string(), "operation canceled");
        assert_eq!(
            MatchError::AlreadyForwarded("/_sys/tq/1".into()).to_string(),
            "already forwarded from /_sys/tq/1; forwarding is single-hop"
        );
    }
}
