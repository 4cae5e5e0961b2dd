use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

/// What went wrong in a cache or file source operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheErrorKind {
    /// No entry (or file) with that name.
    ///
    /// **Retryable:** No.
    NotFound,

    /// The entry exists but is older than the cache TTL.
    ///
    /// **Retryable:** No - the content must be cached again.
    Expired,

    /// A `cache://` URL named a reference the index doesn't know.
    UnknownReference,

    /// A `cache://` URL named a different cache.
    IncorrectHost,

    /// The name is empty or escapes the cache directory.
    InvalidName,

    /// The name resolved to a directory.
    IsDirectory,

    /// The file changed between the original open and a resume.
    Changed,

    /// The write was cancelled before it completed.
    Cancelled,

    /// A resumed write did not start where the kept partial content ends.
    OffsetMismatch,

    /// The filesystem failed.
    ///
    /// **Retryable:** Maybe.
    Io,
}

impl CacheErrorKind {
    /// Does this mean the content is not (or no longer) available?
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CacheErrorKind::NotFound | CacheErrorKind::Expired | CacheErrorKind::UnknownReference
        )
    }

    /// Returns whether this error kind may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheErrorKind::Io | CacheErrorKind::Cancelled)
    }

    /// Returns whether the caller asked for something invalid.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            CacheErrorKind::InvalidName
                | CacheErrorKind::IncorrectHost
                | CacheErrorKind::IsDirectory
                | CacheErrorKind::OffsetMismatch
        )
    }
}

impl fmt::Display for CacheErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheErrorKind::NotFound => write!(f, "not found"),
            CacheErrorKind::Expired => write!(f, "expired cache entry"),
            CacheErrorKind::UnknownReference => write!(f, "unknown reference"),
            CacheErrorKind::IncorrectHost => write!(f, "incorrect host"),
            CacheErrorKind::InvalidName => write!(f, "invalid name"),
            CacheErrorKind::IsDirectory => write!(f, "is a directory"),
            CacheErrorKind::Changed => write!(f, "file has changed"),
            CacheErrorKind::Cancelled => write!(f, "cancelled"),
            CacheErrorKind::OffsetMismatch => write!(f, "upload offset mismatch"),
            CacheErrorKind::Io => write!(f, "I/O error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Controlled by `RUST_BACKTRACE`.
    backtrace: Backtrace,
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// An error from the cache or a file source, with the name involved and the span
/// context where it happened.
#[derive(Debug)]
pub struct CacheError {
    kind: CacheErrorKind,
    name: Option<String>,
    context: Option<&'static str>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    traces: Box<ErrorTrace>,
}

impl CacheError {
    /// An error of `kind` about `name`.
    #[track_caller]
    pub fn new(kind: CacheErrorKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: Some(name.into()),
            context: None,
            source: None,
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// An error of `kind` not tied to a name.
    #[track_caller]
    pub fn kind_only(kind: CacheErrorKind) -> Self {
        Self {
            kind,
            name: None,
            context: None,
            source: None,
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Returns a closure turning an I/O error into a cache error, for use with `map_err`.
    pub fn io(context: &'static str) -> impl FnOnce(io::Error) -> CacheError {
        move |error| {
            let kind = match error.kind() {
                io::ErrorKind::NotFound => CacheErrorKind::NotFound,
                _ => CacheErrorKind::Io,
            };
            let mut err = CacheError::kind_only(kind).with_context(context);
            err.source = Some(Box::new(error));
            err
        }
    }

    /// Attach the name involved.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach a short description of the failed step.
    pub fn with_context(mut self, context: &'static str) -> Self {
        self.context = Some(context);
        self
    }

    /// Attach the underlying error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        self.source = Some(source.into());
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> CacheErrorKind {
        self.kind
    }

    /// Returns the name involved, if known.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the failed step, if recorded.
    pub fn context(&self) -> Option<&str> {
        self.context
    }

    /// See [`CacheErrorKind::is_not_found`].
    pub fn is_not_found(&self) -> bool {
        self.kind.is_not_found()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns the span context at the point where this error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(context) = self.context {
            write!(f, " during {context}")?;
        }
        if let Some(name) = &self.name {
            write!(f, ": {name}")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for CacheError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}

impl From<CacheError> for io::Error {
    fn from(error: CacheError) -> Self {
        let kind = match error.kind {
            CacheErrorKind::NotFound
            | CacheErrorKind::Expired
            | CacheErrorKind::UnknownReference => io::ErrorKind::NotFound,
            CacheErrorKind::InvalidName
            | CacheErrorKind::IncorrectHost
            | CacheErrorKind::OffsetMismatch => {
                io::ErrorKind::InvalidInput
            }
            CacheErrorKind::Cancelled => io::ErrorKind::Interrupted,
            CacheErrorKind::IsDirectory | CacheErrorKind::Changed | CacheErrorKind::Io => {
                io::ErrorKind::Other
            }
        };
        io::Error::new(kind, error)
    }
}
