use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher as _;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use transit::{BoxReader, Scope};
use twox_hash::XxHash64;
use url::Url;

use crate::error::{CacheError, CacheErrorKind};
use crate::file::{FileDescriptor, FileInfo, FileSource};

/// The URL scheme of cache entries.
pub const CACHE_SCHEME: &str = "cache";

/// Directory under the user cache directory used by [`Cache::in_user_cache_dir`].
pub const USER_CACHE_DIR: &str = "blobcache";

const COPY_BUFFER: usize = 64 * 1024;

/// One cached piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The name the content was last cached under.
    pub name: String,

    /// xxHash64 of the content, which is also its file name.
    pub hash: u64,

    /// Media type supplied when caching.
    pub media_type: String,

    /// Size in bytes.
    pub size: u64,

    /// When the entry was written.
    pub added: DateTime<Utc>,
}

impl CacheEntry {
    /// Is this entry older than `ttl` at `now`?
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.added)
            .to_std()
            .is_ok_and(|age| age > ttl)
    }

    /// File name of the content inside the cache directory.
    pub fn file_name(&self) -> String {
        hash_file_name(self.hash)
    }
}

fn hash_file_name(hash: u64) -> String {
    format!("{hash:016x}")
}

#[derive(Debug, Default)]
struct Index {
    names: HashMap<String, u64>,
    entries: HashMap<u64, CacheEntry>,
    partials: HashMap<String, Partial>,
}

/// Content written to a temporary file so far, with its running hash.
#[derive(Clone, Copy)]
struct Partial {
    size: u64,
    hasher: XxHash64,
}

impl Default for Partial {
    fn default() -> Self {
        Self {
            size: 0,
            hasher: XxHash64::with_seed(0),
        }
    }
}

impl fmt::Debug for Partial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partial").field("size", &self.size).finish()
    }
}

/// A failed temporary write, and what of it is worth keeping.
struct Incomplete {
    error: CacheError,
    kept: Option<Partial>,
}

impl Incomplete {
    fn discard(error: CacheError) -> Self {
        Self { error, kept: None }
    }
}

async fn remove_temp(temp: &Utf8Path) {
    if let Err(err) = tokio::fs::remove_file(temp).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(%temp, error = %err, "temporary file not removed");
        }
    }
}

#[derive(Debug)]
struct CacheInner {
    name: String,
    dir: Utf8PathBuf,
    ttl: Duration,
    index: RwLock<Index>,
    writer: tokio::sync::Mutex<()>,
}

/// A local, content-addressed store with a time-to-live.
///
/// Content is written to `<dir>/<xxh64 hex>` and found through a name index. Entries older
/// than the TTL are invisible to lookups, though their files stay on disk until the same
/// content is cached again. Writes are serialized; an entry becomes visible to readers only
/// once its file is complete.
///
/// Clones share the same index.
#[derive(Debug, Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// Open (creating if needed) the cache named `name` stored under `root/name`.
    ///
    /// The name becomes the host of the cache's `cache://` URLs.
    #[tracing::instrument(level = "debug", skip(root), fields(root = tracing::field::Empty))]
    pub async fn new(
        root: impl Into<Utf8PathBuf>,
        name: &str,
        ttl: Duration,
    ) -> Result<Self, CacheError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." || name == "." {
            return Err(CacheError::new(CacheErrorKind::InvalidName, name)
                .with_context("cache name"));
        }
        let root = root.into();
        tracing::Span::current().record("root", root.as_str());
        let dir = root.join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| CacheError::io("create_dir_all")(err).with_name(dir.as_str()))?;

        Ok(Self {
            inner: Arc::new(CacheInner {
                name: name.to_owned(),
                dir,
                ttl,
                index: RwLock::new(Index::default()),
                writer: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Open the cache under the user's cache directory.
    pub async fn in_user_cache_dir(name: &str, ttl: Duration) -> Result<Self, CacheError> {
        let root = dirs::cache_dir()
            .ok_or_else(|| {
                CacheError::kind_only(CacheErrorKind::NotFound).with_context("user cache directory")
            })?
            .join(USER_CACHE_DIR);
        let root = Utf8PathBuf::from_path_buf(root).map_err(|path| {
            CacheError::new(CacheErrorKind::InvalidName, path.to_string_lossy())
                .with_context("user cache directory")
        })?;
        Self::new(root, name, ttl).await
    }

    /// The cache name, used as the host of `cache://` URLs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The directory content is stored in.
    pub fn dir(&self) -> &Utf8Path {
        &self.inner.dir
    }

    /// How long entries stay visible.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// The `cache://` URL for a name.
    pub fn url(&self, name: &str) -> Result<Url, CacheError> {
        let name = crate::validate_name(name)?;
        let url = format!("{CACHE_SCHEME}://{}/{name}", self.inner.name);
        Url::parse(&url).map_err(|err| {
            CacheError::new(CacheErrorKind::InvalidName, name).with_source(err)
        })
    }

    fn path(&self, hash: u64) -> Utf8PathBuf {
        self.inner.dir.join(hash_file_name(hash))
    }

    /// Stream `reader` into the cache under `name`.
    ///
    /// The content is hashed while it is written to a temporary file, which is then renamed
    /// to its hash. Caching a name again replaces the name's index entry.
    ///
    /// If `reader` fails part way, the bytes written so far are kept so that
    /// [`Cache::resume`] can finish the write.
    pub async fn cache<R>(
        &self,
        scope: &Scope,
        name: &str,
        media_type: &str,
        reader: R,
    ) -> Result<FileDescriptor, CacheError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.write(scope, name, media_type, 0, reader).await
    }

    /// Continue a write of `name` which failed after `offset` bytes.
    ///
    /// `reader` supplies the content from `offset` on. An `offset` of zero starts over, like
    /// [`Cache::cache`]. Any other offset must match the kept partial content exactly.
    pub async fn resume<R>(
        &self,
        scope: &Scope,
        name: &str,
        media_type: &str,
        offset: u64,
        reader: R,
    ) -> Result<FileDescriptor, CacheError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.write(scope, name, media_type, offset, reader).await
    }

    /// Bytes kept from a failed write of `name`, if any.
    pub fn partial(&self, name: &str) -> Option<u64> {
        let name = crate::validate_name(name).ok()?;
        self.inner
            .index
            .read()
            .partials
            .get(name)
            .map(|partial| partial.size)
    }

    #[tracing::instrument(skip(self, scope, reader), fields(cache = %self.inner.name))]
    async fn write<R>(
        &self,
        scope: &Scope,
        name: &str,
        media_type: &str,
        offset: u64,
        mut reader: R,
    ) -> Result<FileDescriptor, CacheError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let name = crate::validate_name(name)?.to_owned();
        let _writing = self.inner.writer.lock().await;

        let temp = self
            .inner
            .dir
            .join(format!("{}-temp", name.replace('/', "_")));
        let kept = self.inner.index.write().partials.remove(&name);
        let start = match (offset, kept) {
            (0, _) => Partial::default(),
            (offset, Some(partial)) if partial.size == offset => partial,
            (offset, kept) => {
                tracing::debug!(%name, offset, kept = ?kept.map(|p| p.size), "resume offset mismatch");
                remove_temp(&temp).await;
                return Err(CacheError::new(CacheErrorKind::OffsetMismatch, name));
            }
        };

        let (hash, size) = match self.write_temp(scope, &temp, start, &mut reader).await {
            Ok(written) => (written.hasher.finish(), written.size),
            Err(Incomplete {
                error,
                kept: Some(partial),
            }) => {
                tracing::debug!(%name, size = partial.size, "keeping partial content");
                self.inner.index.write().partials.insert(name.clone(), partial);
                return Err(error.with_name(name));
            }
            Err(Incomplete { error, kept: None }) => {
                remove_temp(&temp).await;
                return Err(error.with_name(name));
            }
        };

        let path = self.path(hash);
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|err| CacheError::io("rename")(err).with_name(name.as_str()))?;

        let entry = CacheEntry {
            name: name.clone(),
            hash,
            media_type: media_type.to_owned(),
            size,
            added: Utc::now(),
        };
        {
            let mut index = self.inner.index.write();
            if let Some(previous) = index.names.insert(name.clone(), hash) {
                if previous != hash {
                    tracing::warn!(%name, previous = %hash_file_name(previous), "replacing cached name");
                }
            }
            index.entries.insert(hash, entry);
        }
        tracing::debug!(%name, hash = %hash_file_name(hash), size, "cached");

        FileDescriptor::new(scope, self.clone(), &name)
    }

    async fn write_temp<R>(
        &self,
        scope: &Scope,
        temp: &Utf8Path,
        start: Partial,
        reader: &mut R,
    ) -> Result<Partial, Incomplete>
    where
        R: AsyncRead + Unpin + Send,
    {
        let file = if start.size == 0 {
            tokio::fs::File::create(temp).await
        } else {
            tokio::fs::OpenOptions::new().append(true).open(temp).await
        }
        .map_err(|err| Incomplete::discard(CacheError::io("open temporary file")(err)))?;
        let mut writer = tokio::io::BufWriter::new(file);
        let mut buffer = vec![0u8; COPY_BUFFER];
        let mut written = start;

        loop {
            if scope.is_done() {
                return Err(Incomplete::discard(CacheError::kind_only(
                    CacheErrorKind::Cancelled,
                )));
            }
            let n = match reader.read(&mut buffer).await {
                Ok(n) => n,
                Err(err) => {
                    let error = CacheError::io("read content")(err);
                    let kept = writer.shutdown().await.is_ok().then_some(written);
                    return Err(Incomplete { error, kept });
                }
            };
            if n == 0 {
                break;
            }
            writer
                .write_all(&buffer[..n])
                .await
                .map_err(|err| Incomplete::discard(CacheError::io("write temporary file")(err)))?;
            written.hasher.write(&buffer[..n]);
            written.size += n as u64;
        }

        writer
            .shutdown()
            .await
            .map_err(|err| Incomplete::discard(CacheError::io("shutdown writer")(err)))?;
        Ok(written)
    }

    /// The live entry for `name`.
    pub fn entry(&self, name: &str) -> Result<CacheEntry, CacheError> {
        let name = crate::validate_name(name)?;
        let index = self.inner.index.read();
        let entry = index
            .names
            .get(name)
            .and_then(|hash| index.entries.get(hash))
            .ok_or_else(|| CacheError::new(CacheErrorKind::NotFound, name))?;
        self.check_expiry(entry)?;
        Ok(entry.clone())
    }

    fn check_expiry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        if entry.is_expired(self.inner.ttl, Utc::now()) {
            tracing::warn!(name = %entry.name, added = %entry.added, "expired cache entry");
            return Err(CacheError::new(CacheErrorKind::Expired, entry.name.as_str()));
        }
        Ok(())
    }

    /// Describe the live entry for `name`.
    pub fn stat(&self, name: &str) -> Result<FileInfo, CacheError> {
        let entry = self.entry(name)?;
        let metadata = self
            .path(entry.hash)
            .metadata()
            .map_err(|err| CacheError::io("stat")(err).with_name(name))?;
        if metadata.is_dir() {
            return Err(CacheError::new(CacheErrorKind::IsDirectory, name));
        }
        Ok(FileInfo {
            name: crate::validate_name(name)?.to_owned(),
            size: metadata.len(),
            modified: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(entry.added),
            is_dir: false,
            media_type: Some(entry.media_type),
        })
    }

    /// Open the live entry for `name`.
    #[tracing::instrument(level = "trace", skip(self), fields(cache = %self.inner.name))]
    pub async fn open(&self, name: &str) -> Result<tokio::fs::File, CacheError> {
        let entry = self.entry(name)?;
        self.open_entry(&entry).await
    }

    /// Open content by its hash.
    pub async fn lookup(&self, hash: u64) -> Result<(CacheEntry, tokio::fs::File), CacheError> {
        let entry = self
            .inner
            .index
            .read()
            .entries
            .get(&hash)
            .cloned()
            .ok_or_else(|| CacheError::new(CacheErrorKind::NotFound, hash_file_name(hash)))?;
        self.check_expiry(&entry)?;
        let file = self.open_entry(&entry).await?;
        Ok((entry, file))
    }

    async fn open_entry(&self, entry: &CacheEntry) -> Result<tokio::fs::File, CacheError> {
        tokio::fs::File::open(self.path(entry.hash))
            .await
            .map_err(|err| CacheError::io("open")(err).with_name(entry.name.as_str()))
    }

    /// Resolve a `cache://<cache name>/<name>` URL to a stable descriptor.
    pub fn source(&self, scope: &Scope, url: &Url) -> Result<FileDescriptor, CacheError> {
        if url.host_str() != Some(self.inner.name.as_str()) {
            return Err(CacheError::new(CacheErrorKind::IncorrectHost, url.as_str()));
        }
        let name = url.path();
        self.entry(name).map_err(|err| {
            if err.kind() == CacheErrorKind::NotFound {
                CacheError::new(CacheErrorKind::UnknownReference, name)
            } else {
                err
            }
        })?;
        FileDescriptor::new(scope, self.clone(), name)
    }
}

#[async_trait::async_trait]
impl FileSource for Cache {
    fn stat(&self, name: &str) -> Result<FileInfo, CacheError> {
        Cache::stat(self, name)
    }

    async fn open(&self, name: &str) -> Result<BoxReader, CacheError> {
        let file = Cache::open(self, name).await?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use std::hash::Hasher as _;

    use tokio::io::AsyncReadExt;
    use transit::Session;

    use super::*;

    async fn cache(ttl: Duration) -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let cache = Cache::new(root, "node", ttl).await.unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn content_is_stored_by_hash() {
        let (_dir, cache) = cache(Duration::from_secs(60)).await;
        let scope = Session::default().scope();
        cache
            .cache(&scope, "library/alpine", "text/plain", &b"hello"[..])
            .await
            .unwrap();

        let entry = cache.entry("library/alpine").unwrap();
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(b"hello");
        assert_eq!(entry.hash, hasher.finish());
        assert!(cache.dir().join(entry.file_name()).is_file());
        assert!(!cache.dir().join("library_alpine-temp").exists());
    }

    struct Broken;

    impl AsyncRead for Broken {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            _: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::other("source went away")))
        }
    }

    #[tokio::test]
    async fn failed_writes_resume_where_they_stopped() {
        let (_dir, cache) = cache(Duration::from_secs(60)).await;
        let scope = Session::default().scope();
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (head, tail) = content.split_at(4_000);

        let err = cache
            .cache(&scope, "library/layer", "text/plain", head.chain(Broken))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CacheErrorKind::Io);
        assert_eq!(cache.partial("library/layer"), Some(4_000));
        assert!(cache.entry("library/layer").is_err());

        cache
            .resume(&scope, "library/layer", "text/plain", 4_000, tail)
            .await
            .unwrap();
        assert_eq!(cache.partial("library/layer"), None);

        let entry = cache.entry("library/layer").unwrap();
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&content);
        assert_eq!(entry.hash, hasher.finish());
        assert_eq!(entry.size, content.len() as u64);

        let mut stored = Vec::new();
        cache
            .open("library/layer")
            .await
            .unwrap()
            .read_to_end(&mut stored)
            .await
            .unwrap();
        assert_eq!(stored, content);
    }

    #[tokio::test]
    async fn resume_at_the_wrong_offset_is_refused() {
        let (_dir, cache) = cache(Duration::from_secs(60)).await;
        let scope = Session::default().scope();
        cache
            .cache(&scope, "library/layer", "text/plain", (&b"abcd"[..]).chain(Broken))
            .await
            .unwrap_err();
        assert_eq!(cache.partial("library/layer"), Some(4));

        let err = cache
            .resume(&scope, "library/layer", "text/plain", 2, &b"cdef"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CacheErrorKind::OffsetMismatch);
        assert!(err.kind().is_client_fault());
        assert_eq!(cache.partial("library/layer"), None);
        assert!(!cache.dir().join("library_layer-temp").exists());

        let err = cache
            .resume(&scope, "library/never", "text/plain", 4, &b"ef"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CacheErrorKind::OffsetMismatch);
    }

    #[tokio::test]
    async fn leading_slash_is_ignored() {
        let (_dir, cache) = cache(Duration::from_secs(60)).await;
        let scope = Session::default().scope();
        cache
            .cache(&scope, "/a/b", "text/plain", &b"x"[..])
            .await
            .unwrap();
        assert_eq!(cache.stat("a/b").unwrap().size, 1);
        assert_eq!(cache.url("/a/b").unwrap().as_str(), "cache://node/a/b");
    }

    #[tokio::test]
    async fn recaching_replaces_name() {
        let (_dir, cache) = cache(Duration::from_secs(60)).await;
        let scope = Session::default().scope();
        cache.cache(&scope, "n", "text/plain", &b"one"[..]).await.unwrap();
        let first = cache.entry("n").unwrap();
        cache.cache(&scope, "n", "text/plain", &b"three"[..]).await.unwrap();
        let second = cache.entry("n").unwrap();
        assert_ne!(first.hash, second.hash);

        let mut content = String::new();
        cache.open("n").await.unwrap().read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "three");

        // Old bytes stay addressable by hash.
        let (entry, _) = cache.lookup(first.hash).await.unwrap();
        assert_eq!(entry.size, 3);
    }

    #[tokio::test]
    async fn source_checks_host_and_reference() {
        let (_dir, cache) = cache(Duration::from_secs(60)).await;
        let scope = Session::default().scope();
        cache.cache(&scope, "known", "text/plain", &b"x"[..]).await.unwrap();

        let other = Url::parse("cache://elsewhere/known").unwrap();
        assert_eq!(
            cache.source(&scope, &other).unwrap_err().kind(),
            CacheErrorKind::IncorrectHost
        );

        let unknown = Url::parse("cache://node/unknown").unwrap();
        assert_eq!(
            cache.source(&scope, &unknown).unwrap_err().kind(),
            CacheErrorKind::UnknownReference
        );

        let known = Url::parse("cache://node/known").unwrap();
        assert_eq!(cache.source(&scope, &known).unwrap().info().size, 1);
    }

    #[tokio::test]
    async fn invalid_names() {
        let (_dir, cache) = cache(Duration::from_secs(60)).await;
        let scope = Session::default().scope();
        let err = cache
            .cache(&scope, "../escape", "text/plain", &b"x"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CacheErrorKind::InvalidName);
        assert_eq!(cache.stat("").unwrap_err().kind(), CacheErrorKind::InvalidName);

        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let err = Cache::new(root, "a/b", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), CacheErrorKind::InvalidName);
    }

    #[tokio::test]
    async fn cancelled_write_leaves_no_entry() {
        let (_dir, cache) = cache(Duration::from_secs(60)).await;
        let scope = Session::default().scope();
        scope.cancel();
        let err = cache
            .cache(&scope, "never", "text/plain", &b"x"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CacheErrorKind::Cancelled);
        assert!(cache.entry("never").unwrap_err().is_not_found());
        assert!(!cache.dir().join("never-temp").exists());
    }

    #[test]
    fn expiry_is_relative_to_added() {
        let added = Utc::now();
        let entry = CacheEntry {
            name: "n".into(),
            hash: 1,
            media_type: "text/plain".into(),
            size: 1,
            added,
        };
        let ttl = Duration::from_secs(10);
        assert!(!entry.is_expired(ttl, added + chrono::Duration::seconds(5)));
        assert!(entry.is_expired(ttl, added + chrono::Duration::seconds(11)));
        assert!(!entry.is_expired(ttl, added - chrono::Duration::seconds(1)));
    }
}
