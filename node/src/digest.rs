//! Digest functions usable as the hash of a [`StreamDescriptor`](crate::StreamDescriptor).

use std::hash::Hasher as _;
use std::sync::Arc;

use sha2::{Digest as _, Sha256};
use thiserror::Error;
use twox_hash::XxHash64;

/// A digest function over complete content.
pub type HashFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, DigestError> + Send + Sync>;

/// Errors from digest functions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
    /// There was nothing to hash.
    #[error("there is no content to checksum")]
    Empty,
}

/// xxHash64 of the content as 8 big-endian bytes.
///
/// Uses the same hash as the blob cache, so digests line up with cache file names.
pub fn hash_xxh64(content: &[u8]) -> Result<Vec<u8>, DigestError> {
    if content.is_empty() {
        return Err(DigestError::Empty);
    }
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(content);
    Ok(hasher.finish().to_be_bytes().to_vec())
}

/// `sha256:<hex>` of the content, as registries write digests.
pub fn hash_sha256(content: &[u8]) -> Result<Vec<u8>, DigestError> {
    if content.is_empty() {
        return Err(DigestError::Empty);
    }
    let digest = Sha256::digest(content);
    Ok(format!("sha256:{}", hex::encode(digest)).into_bytes())
}

/// Box a digest function.
pub fn hash_fn<F>(hash: F) -> HashFn
where
    F: Fn(&[u8]) -> Result<Vec<u8>, DigestError> + Send + Sync + 'static,
{
    Arc::new(hash)
}
