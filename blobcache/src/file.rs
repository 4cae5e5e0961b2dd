//! Files as stable descriptors.
//!
//! A [`FileSource`] is anything that can `stat` and `open` named files: the [`Cache`](crate::Cache)
//! or a plain directory through [`LocalFiles`]. A [`FileDescriptor`] wraps one file from a source
//! as a [`StableDescriptor`] which refuses to resume once the file has changed.

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use transit::{BoxReader, Scope, StableDescriptor, TransitError};

use crate::error::{CacheError, CacheErrorKind};

/// What a [`FileSource`] knows about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// The name the file was looked up by.
    pub name: String,

    /// Size in bytes.
    pub size: u64,

    /// Last modification time.
    pub modified: DateTime<Utc>,

    /// Whether the name resolved to a directory.
    pub is_dir: bool,

    /// Media type, when the source records one.
    pub media_type: Option<String>,
}

/// Named, readable files.
#[async_trait::async_trait]
pub trait FileSource: fmt::Debug + Send + Sync {
    /// Describe a file without opening it.
    fn stat(&self, name: &str) -> Result<FileInfo, CacheError>;

    /// Open a file for reading.
    async fn open(&self, name: &str) -> Result<BoxReader, CacheError>;
}

#[async_trait::async_trait]
impl<S> FileSource for Arc<S>
where
    S: FileSource + ?Sized,
{
    fn stat(&self, name: &str) -> Result<FileInfo, CacheError> {
        (**self).stat(name)
    }

    async fn open(&self, name: &str) -> Result<BoxReader, CacheError> {
        (**self).open(name).await
    }
}

/// One file from a [`FileSource`], readable as a [`StableDescriptor`].
///
/// The descriptor health-checks the file on every read and resumes only if the file still
/// has the size and modification time recorded when it was first described.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    info: FileInfo,
    stable: StableDescriptor,
}

impl FileDescriptor {
    /// Describe `name` from `source`.
    pub fn new<S>(scope: &Scope, source: S, name: &str) -> Result<Self, CacheError>
    where
        S: FileSource + 'static,
    {
        let source: Arc<dyn FileSource> = Arc::new(source);
        let info = source.stat(name)?;
        if info.is_dir {
            return Err(CacheError::new(CacheErrorKind::IsDirectory, name));
        }

        let open = {
            let source = Arc::clone(&source);
            let name = name.to_owned();
            move || {
                let source = Arc::clone(&source);
                let name = name.clone();
                async move { source.open(&name).await.map_err(std::io::Error::from) }
            }
        };

        let resume = {
            let source = Arc::clone(&source);
            let recorded = info.clone();
            move || {
                let source = Arc::clone(&source);
                let recorded = recorded.clone();
                async move {
                    let current = source.stat(&recorded.name)?;
                    if current.size != recorded.size || current.modified < recorded.modified {
                        tracing::debug!(name = %recorded.name, "refusing to resume changed file");
                        return Err(CacheError::new(CacheErrorKind::Changed, recorded.name).into());
                    }
                    source.open(&recorded.name).await.map_err(std::io::Error::from)
                }
            }
        };

        let stable = StableDescriptor::resumable(scope, info.size, open, resume);
        let check_name = name.to_owned();
        stable.add_health_check(move || match source.stat(&check_name) {
            Ok(info) if info.is_dir => Err(TransitError::health_check(format!(
                "{check_name} is a directory"
            ))),
            Ok(_) => Ok(()),
            Err(err) => Err(TransitError::health_check(err)),
        });

        Ok(Self { info, stable })
    }

    /// The file as it was when described.
    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    /// The stable descriptor over the file.
    pub fn stable(&self) -> &StableDescriptor {
        &self.stable
    }

    /// Give up the file details, keeping the descriptor.
    pub fn into_stable(self) -> StableDescriptor {
        self.stable
    }
}

impl From<FileDescriptor> for StableDescriptor {
    fn from(descriptor: FileDescriptor) -> Self {
        descriptor.stable
    }
}

/// Files under a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFiles {
    root: Utf8PathBuf,
}

impl LocalFiles {
    /// Serve files below `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory files are served from.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, name: &str) -> Result<Utf8PathBuf, CacheError> {
        let name = crate::validate_name(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait::async_trait]
impl FileSource for LocalFiles {
    fn stat(&self, name: &str) -> Result<FileInfo, CacheError> {
        let path = self.path(name)?;
        let metadata = path
            .metadata()
            .map_err(|err| CacheError::io("stat")(err).with_name(name))?;
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .map_err(|err| CacheError::io("modification time")(err).with_name(name))?;
        Ok(FileInfo {
            name: name.to_owned(),
            size: metadata.len(),
            modified,
            is_dir: metadata.is_dir(),
            media_type: None,
        })
    }

    #[tracing::instrument(level = "trace", skip(self), fields(root = %self.root))]
    async fn open(&self, name: &str) -> Result<BoxReader, CacheError> {
        let path = self.path(name)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| CacheError::io("open")(err).with_name(name))?;
        Ok(Box::new(file))
    }
}
