//! Stable descriptors: content which can be re-read from the start for a bounded time.
//!
//! A [`StableDescriptor`] wraps a producer of readers. Every read is guarded by the
//! descriptor's stability deadline and its health checks. When a read fails with a temporary
//! outage, the descriptor remembers how far it got; the next [`StableDescriptor::open`] uses
//! the resume producer and silently skips the bytes that were already delivered.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, BufReader, ReadBuf};
use tokio::sync::OwnedMutexGuard;

use crate::error::TransitError;
use crate::scope::Scope;

/// A boxed, sendable reader.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opens a fresh reader over the content.
pub type Producer = Arc<dyn Fn() -> BoxFuture<'static, io::Result<BoxReader>> + Send + Sync>;

/// Reports whether the content is still readable.
pub type HealthCheck = Arc<dyn Fn() -> Result<(), TransitError> + Send + Sync>;

/// Box an async reader factory into a [`Producer`].
pub fn producer<F, Fut, R>(open: F) -> Producer
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<R>> + Send + 'static,
    R: AsyncRead + Send + Unpin + 'static,
{
    Arc::new(move || {
        let opening = open();
        Box::pin(async move { opening.await.map(|reader| Box::new(reader) as BoxReader) })
    })
}

/// Box a closure into a [`HealthCheck`].
pub fn health_check<F>(check: F) -> HealthCheck
where
    F: Fn() -> Result<(), TransitError> + Send + Sync + 'static,
{
    Arc::new(check)
}

type Content = Option<BufReader<BoxReader>>;

/// Re-readable content of a known size, valid until a deadline.
///
/// Clones share the same state. Only one [`StableReader`] may be open at a time; a second
/// [`StableDescriptor::open`] waits until the first reader is dropped.
#[derive(Clone)]
pub struct StableDescriptor {
    inner: Arc<Inner>,
}

struct Inner {
    total: u64,
    open: Producer,
    resume: Option<Producer>,
    status: Mutex<Status>,
    content: Arc<tokio::sync::Mutex<Content>>,
}

struct Status {
    deadline: Instant,
    checks: Vec<HealthCheck>,
    err: Option<TransitError>,
}

impl fmt::Debug for StableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.inner.status.lock();
        f.debug_struct("StableDescriptor")
            .field("total", &self.inner.total)
            .field("resumable", &self.inner.resume.is_some())
            .field("deadline", &status.deadline)
            .field("checks", &status.checks.len())
            .field("err", &status.err)
            .finish()
    }
}

impl StableDescriptor {
    /// Content of `total` bytes produced by `open`.
    ///
    /// The deadline is the scope deadline, or the session's minimum stability from now.
    pub fn new<F, Fut, R>(scope: &Scope, total: u64, open: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<R>> + Send + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::from_producers(scope, total, producer(open), None)
    }

    /// Like [`StableDescriptor::new`], with a separate producer used after an outage.
    pub fn resumable<F, Fut, R, G, Gut, S>(scope: &Scope, total: u64, open: F, resume: G) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<R>> + Send + 'static,
        R: AsyncRead + Send + Unpin + 'static,
        G: Fn() -> Gut + Send + Sync + 'static,
        Gut: Future<Output = io::Result<S>> + Send + 'static,
        S: AsyncRead + Send + Unpin + 'static,
    {
        Self::from_producers(scope, total, producer(open), Some(producer(resume)))
    }

    /// Build from already boxed producers.
    pub fn from_producers(
        scope: &Scope,
        total: u64,
        open: Producer,
        resume: Option<Producer>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                total,
                open,
                resume,
                status: Mutex::new(Status {
                    deadline: stability_deadline(scope),
                    checks: Vec::new(),
                    err: None,
                }),
                content: Arc::new(tokio::sync::Mutex::new(None)),
            }),
        }
    }

    /// In-memory content, mostly useful for tests and small payloads.
    pub fn from_bytes(scope: &Scope, content: impl Into<Bytes>) -> Self {
        let content: Bytes = content.into();
        let total = content.len() as u64;
        let resume = content.clone();
        Self::resumable(
            scope,
            total,
            move || {
                let content = content.clone();
                async move { Ok(io::Cursor::new(content)) }
            },
            move || {
                let content = resume.clone();
                async move { Ok(io::Cursor::new(content)) }
            },
        )
    }

    /// Total size of the content in bytes.
    pub fn total(&self) -> u64 {
        self.inner.total
    }

    /// Register a health check run before each read.
    pub fn add_health_check<F>(&self, check: F) -> &Self
    where
        F: Fn() -> Result<(), TransitError> + Send + Sync + 'static,
    {
        self.add_health_checks([health_check(check)])
    }

    /// Register several health checks.
    pub fn add_health_checks<I>(&self, checks: I) -> &Self
    where
        I: IntoIterator<Item = HealthCheck>,
    {
        self.inner.status.lock().checks.extend(checks);
        self
    }

    /// The sticky error, if any.
    pub fn error(&self) -> Option<TransitError> {
        self.inner.status.lock().err.clone()
    }

    /// Record an error against the descriptor.
    ///
    /// A [`TransitError::TemporaryOutage`] makes the next open resume; any other error makes
    /// the descriptor unusable until [`StableDescriptor::reset`].
    pub fn record_error(&self, err: TransitError) {
        tracing::debug!(error = %err, "stable descriptor error");
        self.inner.status.lock().err = Some(err);
    }

    /// Clear the sticky error and recompute the stability deadline.
    pub fn reset(&self, scope: &Scope) {
        let mut status = self.inner.status.lock();
        status.err = None;
        status.deadline = stability_deadline(scope);
    }

    /// Fails once the deadline has passed or when any health check fails.
    pub fn is_stable(&self) -> Result<(), TransitError> {
        let checks = {
            let status = self.inner.status.lock();
            if Instant::now() > status.deadline {
                return Err(TransitError::Unstable);
            }
            status.checks.clone()
        };
        for check in &checks {
            check()?;
        }
        Ok(())
    }

    /// Open a reading session.
    ///
    /// After a temporary outage the resume producer is used and the already delivered
    /// bytes are discarded. Other sticky errors are returned as-is.
    #[tracing::instrument(level = "trace", skip(self), fields(total = self.inner.total))]
    pub async fn open(&self) -> Result<StableReader, TransitError> {
        let mut content = Arc::clone(&self.inner.content).lock_owned().await;

        let (reader, resync, resumed) = match self.error() {
            Some(TransitError::TemporaryOutage(outage)) => match &self.inner.resume {
                Some(resume) => {
                    tracing::debug!(current = outage.current(), "resuming after outage");
                    (resume().await?, outage.current(), true)
                }
                None => return Err(TransitError::TemporaryOutage(outage)),
            },
            Some(err) => return Err(err),
            None => ((self.inner.open)().await?, 0, false),
        };

        *content = Some(BufReader::new(reader));
        Ok(StableReader {
            descriptor: self.clone(),
            content,
            start: resync,
            resync,
            resumed,
        })
    }
}

fn stability_deadline(scope: &Scope) -> Instant {
    scope
        .deadline()
        .unwrap_or_else(|| Instant::now() + scope.session().minimum_stability())
}

/// An exclusive reading session over a [`StableDescriptor`].
///
/// Dropping the reader closes the session.
pub struct StableReader {
    descriptor: StableDescriptor,
    content: OwnedMutexGuard<Content>,
    start: u64,
    resync: u64,
    resumed: bool,
}

impl fmt::Debug for StableReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StableReader")
            .field("total", &self.descriptor.total())
            .field("start", &self.start)
            .field("resync", &self.resync)
            .field("resumed", &self.resumed)
            .finish()
    }
}

impl StableReader {
    /// The descriptor this session reads from.
    pub fn descriptor(&self) -> &StableDescriptor {
        &self.descriptor
    }

    /// Offset into the content of the first byte this session delivers.
    pub fn offset(&self) -> u64 {
        self.start
    }

    /// Did this session resume after an outage instead of starting from the beginning?
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Close the session, releasing the descriptor for the next open.
    pub fn close(self) {
        tracing::trace!("stable reader closed");
    }

    fn fail(&mut self, err: TransitError) -> Poll<io::Result<()>> {
        self.descriptor.record_error(err.clone());
        Poll::Ready(Err(err.into()))
    }
}

const RESYNC_CHUNK: usize = 8 * 1024;

impl AsyncRead for StableReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(err) = this.descriptor.error() {
            if !err.is_outage() {
                return Poll::Ready(Err(err.into()));
            }
        }

        if this.resync > 0 {
            let mut scratch = [0u8; RESYNC_CHUNK];
            while this.resync > 0 {
                let Some(content) = this.content.as_mut() else {
                    return this.fail(TransitError::Unset("content"));
                };
                let want = usize::try_from(this.resync)
                    .unwrap_or(RESYNC_CHUNK)
                    .min(RESYNC_CHUNK);
                let mut discard = ReadBuf::new(&mut scratch[..want]);
                match ready!(Pin::new(content).poll_read(cx, &mut discard)) {
                    Ok(()) if discard.filled().is_empty() => {
                        return this.fail(TransitError::PositionLost);
                    }
                    Ok(()) => this.resync -= discard.filled().len() as u64,
                    Err(err) => return this.fail(err.into()),
                }
            }
            tracing::trace!("resynchronized after outage");
            let mut status = this.descriptor.inner.status.lock();
            if status.err.as_ref().is_some_and(TransitError::is_outage) {
                status.err = None;
            }
        }

        if !this.resumed {
            if let Err(err) = this.descriptor.is_stable() {
                return this.fail(err);
            }
        }

        let Some(content) = this.content.as_mut() else {
            return this.fail(TransitError::Unset("content"));
        };
        match ready!(Pin::new(content).poll_read(cx, buf)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(err) => this.fail(err.into()),
        }
    }
}
