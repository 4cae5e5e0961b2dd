//! # Blob cache
//!
//! A local, content-addressed store for transfer results, and the [`FileSource`] capability
//! used to turn stored files into [`transit::StableDescriptor`]s.

mod cache;
mod error;
mod file;

#[doc(inline)]
pub use cache::{Cache, CacheEntry, CACHE_SCHEME, USER_CACHE_DIR};
#[doc(inline)]
pub use error::{CacheError, CacheErrorKind};
#[doc(inline)]
pub use file::{FileDescriptor, FileInfo, FileSource, LocalFiles};

/// Strip leading slashes and reject names which are empty or climb out of their directory.
pub(crate) fn validate_name(name: &str) -> Result<&str, CacheError> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(CacheError::new(CacheErrorKind::InvalidName, name));
    }
    Ok(trimmed)
}
