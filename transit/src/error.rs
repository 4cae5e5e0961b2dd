//! Errors raised while moving content between descriptors.
//!
//! Two of these errors are special. A [`TransitError::TemporaryOutage`] is recorded on a
//! [`StableDescriptor`](crate::StableDescriptor) when its source goes away for a while, and
//! a [`TransitError::Interrupted`] is returned by a transition that made partial progress.
//! Both carry an [`IncompleteTransition`], which knows how far the transfer got and how long
//! to wait before trying again.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The flavor of an [`IncompleteTransition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncompleteKind {
    /// The source became temporarily unavailable.
    Outage,

    /// The transition stopped early but may be resumed.
    Interrupted,
}

impl fmt::Display for IncompleteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncompleteKind::Outage => f.write_str("temporary outage"),
            IncompleteKind::Interrupted => f.write_str("interrupted transition"),
        }
    }
}

/// A transfer which stopped at `current` bytes and should be retried after a cooldown.
///
/// Created by [`Session::temporary_outage`](crate::Session::temporary_outage) and
/// [`Session::interrupted_transition`](crate::Session::interrupted_transition). The cooldown
/// is cut short when the owning session shuts down.
#[derive(Debug, Clone)]
pub struct IncompleteTransition {
    current: u64,
    cooldown: Duration,
    kind: IncompleteKind,
    session: CancellationToken,
}

impl IncompleteTransition {
    pub(crate) fn new(
        current: u64,
        cooldown: Duration,
        kind: IncompleteKind,
        session: CancellationToken,
    ) -> Self {
        Self {
            current,
            cooldown,
            kind,
            session,
        }
    }

    /// Bytes transferred before the transfer stopped.
    pub fn current(&self) -> u64 {
        self.current
    }

    /// How long to wait before retrying.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Outage or interruption.
    pub fn kind(&self) -> IncompleteKind {
        self.kind
    }

    /// Wait out the cooldown, returning early if the session shuts down.
    ///
    /// Each call starts a fresh timer.
    pub async fn cool_down(&self) -> IncompleteKind {
        tokio::select! {
            () = tokio::time::sleep(self.cooldown) => {},
            () = self.session.cancelled() => {
                tracing::trace!(kind = %self.kind, "cooldown cut short by shutdown");
            },
        }
        self.kind
    }
}

impl From<IncompleteTransition> for TransitError {
    fn from(incomplete: IncompleteTransition) -> Self {
        match incomplete.kind {
            IncompleteKind::Outage => TransitError::TemporaryOutage(incomplete),
            IncompleteKind::Interrupted => TransitError::Interrupted(incomplete),
        }
    }
}

/// Errors from stable and transient descriptors.
#[derive(Debug, Clone, Error)]
pub enum TransitError {
    /// The source is temporarily unavailable.
    #[error("temporary outage at offset {}", .0.current())]
    TemporaryOutage(IncompleteTransition),

    /// The transition made partial progress and can be retried.
    #[error("incomplete transition at offset {}", .0.current())]
    Interrupted(IncompleteTransition),

    /// An interruption was requested with a cooldown below the session minimum.
    #[error("cooldown must be at least {minimum:?}, got {requested:?}")]
    CooldownTooShort {
        /// The cooldown that was asked for.
        requested: Duration,
        /// The session minimum.
        minimum: Duration,
    },

    /// The stability deadline passed; the descriptor must be reset or recreated.
    #[error("descriptor must be reset or recreated")]
    Unstable,

    /// A resumed stream ended before the resume offset was reached.
    #[error("could not recover position from outage")]
    PositionLost,

    /// A required field has not been configured.
    #[error("{0} is not set")]
    Unset(&'static str),

    /// A value failed validation.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// A health check rejected the source.
    #[error("health check failed: {0}")]
    HealthCheck(String),

    /// Another transition is already running on this descriptor.
    #[error("previous transition did not complete")]
    AlreadyActive,

    /// The descriptor has already transitioned.
    #[error("transition has already completed")]
    AlreadyComplete,

    /// Waiting on a descriptor that never started a transition.
    #[error("descriptor hasn't started to transition yet")]
    NotStarted,

    /// The transition did not settle within the wait timeout.
    #[error("waiting for the transition timed out")]
    WaitTimeout,

    /// The scope was cancelled.
    #[error("operation was cancelled")]
    Cancelled,

    /// The scope deadline has passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// An I/O error from the underlying reader.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Any other failure, usually from a transition function.
    #[error("{0}")]
    Other(Arc<dyn StdError + Send + Sync + 'static>),
}

impl TransitError {
    /// Wrap an arbitrary error.
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        TransitError::Other(Arc::from(error.into()))
    }

    /// A failed health check with a reason.
    pub fn health_check(reason: impl fmt::Display) -> Self {
        TransitError::HealthCheck(reason.to_string())
    }

    /// The incomplete transition carried by outages and interruptions.
    pub fn incomplete(&self) -> Option<&IncompleteTransition> {
        match self {
            TransitError::TemporaryOutage(incomplete) | TransitError::Interrupted(incomplete) => {
                Some(incomplete)
            }
            _ => None,
        }
    }

    /// Is this a temporary outage?
    pub fn is_outage(&self) -> bool {
        matches!(self, TransitError::TemporaryOutage(_))
    }

    /// Is this an interrupted transition?
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TransitError::Interrupted(_))
    }

    /// Can the caller retry the same operation later?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransitError::TemporaryOutage(_)
                | TransitError::Interrupted(_)
                | TransitError::AlreadyActive
                | TransitError::WaitTimeout
        )
    }

    /// Wait out the cooldown of an incomplete transition, then hand the error back.
    ///
    /// Errors without a cooldown are returned immediately.
    pub async fn settle(self) -> Self {
        if let Some(incomplete) = self.incomplete() {
            incomplete.cool_down().await;
        }
        self
    }
}

impl From<io::Error> for TransitError {
    fn from(error: io::Error) -> Self {
        if let Some(inner) = error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<TransitError>())
        {
            return inner.clone();
        }
        TransitError::Io(Arc::new(error))
    }
}

impl From<TransitError> for io::Error {
    fn from(error: TransitError) -> Self {
        let kind = match &error {
            TransitError::Io(inner) => inner.kind(),
            TransitError::Cancelled => io::ErrorKind::Interrupted,
            TransitError::DeadlineExceeded | TransitError::WaitTimeout => io::ErrorKind::TimedOut,
            TransitError::PositionLost => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, error)
    }
}
