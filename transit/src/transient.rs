//! Transient descriptors: content on its way to a destination.
//!
//! A [`TransientDescriptor`] ties together a stable source, a destination [`Url`], and a
//! transition function which copies one to the other. At most one transition runs at a time.
//! Progress is tracked as an offset against the expected size, and a transition which is
//! interrupted part way records how far it got so the next attempt can pick up from there.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use url::Url;

use crate::error::TransitError;
use crate::scope::Scope;
use crate::stable::{StableDescriptor, StableReader};

/// The future returned by a [`TransitionFn`].
pub type TransitionFuture = BoxFuture<'static, Result<StableDescriptor, TransitError>>;

/// Copies a source reader to a destination, producing the stable result.
pub type TransitionFn = Arc<dyn Fn(Scope, Url, StableReader) -> TransitionFuture + Send + Sync>;

/// Lifecycle of a descriptor's transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// No transition has ever been started.
    Unstarted,

    /// A transition is running.
    Active,

    /// The last transition has finished, successfully or not.
    Settled,
}

/// A progress snapshot.
#[derive(Debug, Clone)]
pub struct Position {
    /// Bytes transferred so far.
    pub offset: u64,

    /// Bytes expected in total, zero when unknown.
    pub expected: u64,

    /// `offset / expected`, exactly `1.0` once complete and `0.0` when unknown.
    pub progress: f64,

    /// The sticky error, if any.
    pub error: Option<TransitError>,
}

impl Position {
    /// Has everything been transferred?
    pub fn is_complete(&self) -> bool {
        self.progress >= 1.0 && self.offset == self.expected
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.offset, self.expected, self.progress)
    }
}

/// Content which is being, or will be, transferred to a destination.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct TransientDescriptor {
    inner: Arc<Inner>,
}

struct Inner {
    fields: Mutex<Fields>,
    activity: watch::Sender<Activity>,
}

#[derive(Default)]
struct Fields {
    offset: u64,
    expected: Option<u64>,
    location: Option<Url>,
    source: Option<StableDescriptor>,
    transition: Option<TransitionFn>,
    active: Option<Scope>,
    err: Option<TransitError>,
}

struct Snapshot {
    transition: TransitionFn,
    source: StableDescriptor,
    location: Url,
    expected: u64,
}

impl Fields {
    fn snapshot(&self) -> Result<Snapshot, TransitError> {
        let transition = self
            .transition
            .clone()
            .ok_or(TransitError::Unset("transition"))?;
        let source = self.source.clone().ok_or(TransitError::Unset("source"))?;
        let location = self
            .location
            .clone()
            .ok_or(TransitError::Unset("location"))?;
        let expected = self.expected.ok_or(TransitError::Unset("expected size"))?;
        Ok(Snapshot {
            transition,
            source,
            location,
            expected,
        })
    }

    fn position(&self) -> Position {
        let expected = self.expected.unwrap_or(0);
        let progress = match self.expected {
            None => 0.0,
            Some(expected) if self.offset == expected => 1.0,
            Some(expected) => self.offset as f64 / expected as f64,
        };
        Position {
            offset: self.offset,
            expected,
            progress,
            error: self.err.clone(),
        }
    }
}

impl fmt::Debug for TransientDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.inner.fields.lock();
        f.debug_struct("TransientDescriptor")
            .field("offset", &fields.offset)
            .field("expected", &fields.expected)
            .field("location", &fields.location.as_ref().map(Url::as_str))
            .field("source", &fields.source)
            .field("active", &fields.active.is_some())
            .field("err", &fields.err)
            .field("activity", &*self.inner.activity.borrow())
            .finish()
    }
}

impl Default for TransientDescriptor {
    fn default() -> Self {
        let (activity, _) = watch::channel(Activity::Unstarted);
        Self {
            inner: Arc::new(Inner {
                fields: Mutex::new(Fields::default()),
                activity,
            }),
        }
    }
}

impl TransientDescriptor {
    /// An empty descriptor. Configure it with the setters before transitioning.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the function which performs the transfer.
    pub fn set_transition<F, Fut>(&self, transition: F) -> &Self
    where
        F: Fn(Scope, Url, StableReader) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StableDescriptor, TransitError>> + Send + 'static,
    {
        let transition: TransitionFn =
            Arc::new(move |scope, location, reader| Box::pin(transition(scope, location, reader)));
        self.inner.fields.lock().transition = Some(transition);
        self
    }

    /// Set the source. It must currently be stable.
    pub fn set_source(&self, source: StableDescriptor) -> Result<&Self, TransitError> {
        source.is_stable()?;
        self.inner.fields.lock().source = Some(source);
        Ok(self)
    }

    /// Set the destination.
    pub fn set_location(&self, location: Url) -> &Self {
        self.inner.fields.lock().location = Some(location);
        self
    }

    /// Set the number of bytes the transfer should produce.
    pub fn set_expected(&self, expected: u64) -> Result<&Self, TransitError> {
        let mut fields = self.inner.fields.lock();
        if fields.offset > expected {
            return Err(TransitError::Invalid {
                field: "expected size",
                reason: "smaller than the current offset",
            });
        }
        fields.expected = Some(expected);
        drop(fields);
        Ok(self)
    }

    /// Set how far the transfer has progressed.
    pub fn set_offset(&self, offset: u64) -> Result<&Self, TransitError> {
        let mut fields = self.inner.fields.lock();
        if fields.expected.is_some_and(|expected| offset > expected) {
            return Err(TransitError::Invalid {
                field: "offset",
                reason: "larger than the expected size",
            });
        }
        fields.offset = offset;
        drop(fields);
        Ok(self)
    }

    /// The current source.
    pub fn source(&self) -> Option<StableDescriptor> {
        self.inner.fields.lock().source.clone()
    }

    /// The current destination.
    pub fn location(&self) -> Option<Url> {
        self.inner.fields.lock().location.clone()
    }

    /// Bytes transferred so far.
    pub fn offset(&self) -> u64 {
        self.inner.fields.lock().offset
    }

    /// The expected size, if set.
    pub fn expected(&self) -> Option<u64> {
        self.inner.fields.lock().expected
    }

    /// The sticky error, if any.
    pub fn error(&self) -> Option<TransitError> {
        self.inner.fields.lock().err.clone()
    }

    /// Forget the sticky error so the transfer can be attempted again.
    pub fn clear_error(&self) {
        self.inner.fields.lock().err = None;
    }

    /// Is a transition running right now?
    pub fn is_active(&self) -> bool {
        *self.inner.activity.borrow() == Activity::Active
    }

    /// The lifecycle state of the last transition.
    pub fn activity(&self) -> Activity {
        *self.inner.activity.borrow()
    }

    /// Cancel the running transition, if any.
    pub fn cancel(&self) {
        if let Some(active) = self.inner.fields.lock().active.as_ref() {
            tracing::debug!("cancelling active transition");
            active.cancel();
        }
    }

    /// A snapshot of progress.
    pub fn position(&self) -> Position {
        self.inner.fields.lock().position()
    }

    /// Start a transition if one is needed.
    ///
    /// Fails when the scope is done, when an error is stuck on the descriptor, when a
    /// field is unset, when the source is not stable, when the transfer already completed,
    /// or when another transition is running. Interruptions never stick, so a failed
    /// attempt that was interrupted is retried by calling this again; any other failure
    /// must be cleared with [`TransientDescriptor::clear_error`] first. An expired scope
    /// also shuts the session down. Must be called from within a tokio runtime.
    pub fn should_transition(&self, scope: &Scope) -> Result<TransitionHandle, TransitError> {
        if scope.is_cancelled() {
            return Err(TransitError::Cancelled);
        }
        if scope.is_expired() {
            tracing::warn!("transition requested past its deadline, shutting down session");
            scope.session().shutdown();
            return Err(TransitError::DeadlineExceeded);
        }

        let source = {
            let fields = self.inner.fields.lock();
            if let Some(err) = &fields.err {
                return Err(err.clone());
            }
            if fields
                .expected
                .is_some_and(|expected| fields.offset == expected)
            {
                return Err(TransitError::AlreadyComplete);
            }
            fields.snapshot()?.source
        };

        if let Err(err) = source.is_stable() {
            tracing::debug!(error = %err, "source is not stable, transition refused");
            return Err(err);
        }

        if self.is_active() {
            return Err(TransitError::AlreadyActive);
        }

        self.transition(scope)
    }

    /// Start a transition unconditionally, unless one is already running.
    ///
    /// The transition runs on its own task. The returned handle resolves when it settles;
    /// dropping the handle does not stop the transition. Must be called from within a
    /// tokio runtime.
    pub fn transition(&self, scope: &Scope) -> Result<TransitionHandle, TransitError> {
        let mut previous = Activity::Unstarted;
        let claimed = self.inner.activity.send_if_modified(|activity| {
            previous = *activity;
            if previous == Activity::Active {
                false
            } else {
                *activity = Activity::Active;
                true
            }
        });
        if !claimed {
            return Err(TransitError::AlreadyActive);
        }

        let child = scope.child();
        let snapshot = {
            let mut fields = self.inner.fields.lock();
            let snapshot = fields.snapshot();
            if snapshot.is_ok() {
                fields.active = Some(child.clone());
            }
            snapshot
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.inner.activity.send_replace(previous);
                return Err(err);
            }
        };

        let span = tracing::debug_span!(
            "transition",
            location = %snapshot.location,
            expected = snapshot.expected
        );
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(
            async move {
                tracing::debug!("transition started");
                let Snapshot {
                    transition,
                    source,
                    location,
                    expected,
                } = snapshot;
                let run = AssertUnwindSafe(run(transition, child.clone(), location, source))
                    .catch_unwind()
                    .map(|outcome| {
                        outcome.unwrap_or_else(|_| {
                            Err(TransitError::other("transition function panicked"))
                        })
                    });
                let outcome = tokio::select! {
                    biased;
                    () = child.done() => Err(if child.is_cancelled() {
                        TransitError::Cancelled
                    } else {
                        TransitError::DeadlineExceeded
                    }),
                    outcome = run => outcome,
                };
                inner.settle(outcome, expected)
            }
            .instrument(span),
        );

        Ok(TransitionHandle { task })
    }

    /// Wait for the running transition to settle and return the sticky error.
    ///
    /// Returns immediately when no transition is running.
    pub async fn wait(&self, timeout: Duration) -> Result<(), TransitError> {
        let mut activity = self.inner.activity.subscribe();
        if *activity.borrow_and_update() == Activity::Unstarted {
            return Err(TransitError::NotStarted);
        }

        match tokio::time::timeout(timeout, activity.wait_for(|a| *a != Activity::Active)).await {
            Err(_) => return Err(TransitError::WaitTimeout),
            Ok(Err(_)) => return Err(TransitError::Cancelled),
            Ok(Ok(_)) => {}
        }

        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn run(
    transition: TransitionFn,
    scope: Scope,
    location: Url,
    source: StableDescriptor,
) -> Result<StableDescriptor, TransitError> {
    let reader = source.open().await?;
    transition(scope, location, reader).await
}

impl Inner {
    fn settle(
        &self,
        outcome: Result<StableDescriptor, TransitError>,
        expected: u64,
    ) -> Result<(), TransitError> {
        let result = {
            let mut fields = self.fields.lock();
            fields.active = None;
            match outcome {
                Ok(stable) => {
                    tracing::debug!("transition complete");
                    fields.source = Some(stable);
                    fields.offset = expected;
                    fields.location = None;
                    fields.err = None;
                    Ok(())
                }
                Err(TransitError::Interrupted(interruption))
                    if interruption.current() <= expected =>
                {
                    tracing::debug!(current = interruption.current(), "transition interrupted");
                    fields.offset = interruption.current();
                    fields.err = None;
                    Err(TransitError::Interrupted(interruption))
                }
                Err(TransitError::Interrupted(interruption)) => {
                    tracing::warn!(
                        current = interruption.current(),
                        "interruption reported past the expected size"
                    );
                    let err = TransitError::Invalid {
                        field: "offset",
                        reason: "larger than the expected size",
                    };
                    fields.err = Some(err.clone());
                    Err(err)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "transition failed");
                    fields.err = Some(err.clone());
                    Err(err)
                }
            }
        };
        self.activity.send_replace(Activity::Settled);
        result
    }
}

/// Resolves when a spawned transition settles.
///
/// Yields `Ok(())` on success, or the error the transition settled with. An interrupted
/// transition yields [`TransitError::Interrupted`] even though no sticky error is recorded.
#[derive(Debug)]
pub struct TransitionHandle {
    task: JoinHandle<Result<(), TransitError>>,
}

impl Future for TransitionHandle {
    type Output = Result<(), TransitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.task
            .poll_unpin(cx)
            .map(|joined| joined.unwrap_or_else(|err| Err(TransitError::other(err))))
    }
}
