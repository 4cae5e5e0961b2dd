//! Completion state of one resource.

use std::io;

use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use http::Method;
use http_body_util::BodyExt as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;
use crate::digest::HashFn;
use crate::error::NodeError;
use crate::node::Node;

/// Media type of a state which has been started but not committed.
pub const TRANSIENT_MEDIA_TYPE: &str = "transient+unknown";

/// Errors from [`State`] transitions and persistence.
#[derive(Debug, Error)]
pub enum StateError {
    /// Commit on a state which is not in transit.
    #[error("state cannot be recommitted, start a new instance instead")]
    Recommitted,

    /// Commit with a hash different from the one the state was started with.
    #[error("hash does not match the expected hash")]
    HashMismatch,

    /// The state has not been committed.
    #[error("state is in transit")]
    InTransit,

    /// Fewer bytes than the full size have been recorded.
    #[error("state is incomplete")]
    Incomplete,

    /// The state has no hash.
    #[error("state must have a non-zero hash")]
    ZeroHash,

    /// An offset past the end of the content.
    #[error("offset {offset} is larger than the size {size}")]
    OffsetOutOfRange {
        /// The offending offset.
        offset: u64,
        /// The content size.
        size: u64,
    },

    /// The stored record could not be written or parsed.
    #[error("invalid state record: {0}")]
    Json(#[from] serde_json::Error),

    /// The stored hash is not base64.
    #[error("invalid state hash: {0}")]
    Hash(#[from] base64::DecodeError),
}

/// Media type, progress and digest of one resource.
///
/// A state is stable when it has been committed with a media type, all bytes have been
/// recorded and it carries a hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    media_type: String,
    offset: u64,
    size: u64,
    hash: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    mediatype: String,
    offset: u64,
    size: u64,
    hash: String,
}

impl State {
    /// A state in transit, expecting `size` bytes which should hash to `expected_hash`.
    pub fn start(size: u64, expected_hash: impl Into<Vec<u8>>) -> Self {
        Self {
            media_type: TRANSIENT_MEDIA_TYPE.to_owned(),
            offset: 0,
            size,
            hash: expected_hash.into(),
        }
    }

    /// Commit the state with its real media type, if `hash` matches the expected hash.
    pub fn commit(&mut self, media_type: &str, hash: &[u8]) -> Result<(), StateError> {
        if self.media_type != TRANSIENT_MEDIA_TYPE {
            return Err(StateError::Recommitted);
        }
        if !self.compare(hash) {
            return Err(StateError::HashMismatch);
        }
        self.media_type = media_type.to_owned();
        Ok(())
    }

    /// Record how many bytes have been received.
    pub fn set_offset(&mut self, offset: u64) -> Result<(), StateError> {
        if offset > self.size {
            return Err(StateError::OffsetOutOfRange {
                offset,
                size: self.size,
            });
        }
        self.offset = offset;
        Ok(())
    }

    /// Is the state committed, complete and hashed?
    pub fn is_stable(&self) -> Result<(), StateError> {
        if self.media_type == TRANSIENT_MEDIA_TYPE {
            return Err(StateError::InTransit);
        }
        if self.offset != self.size {
            return Err(StateError::Incomplete);
        }
        if self.hash.is_empty() {
            return Err(StateError::ZeroHash);
        }
        Ok(())
    }

    /// Does `hash` equal the state's hash?
    pub fn compare(&self, hash: &[u8]) -> bool {
        self.hash == hash
    }

    /// The media type, [`TRANSIENT_MEDIA_TYPE`] until committed.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Bytes received.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Expected size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The digest.
    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    /// Write the state as a JSON record.
    pub fn store<W: io::Write>(&self, writer: W) -> Result<(), StateError> {
        let record = Record {
            mediatype: self.media_type.clone(),
            offset: self.offset,
            size: self.size,
            hash: BASE64_STANDARD.encode(&self.hash),
        };
        serde_json::to_writer(writer, &record)?;
        Ok(())
    }

    /// Read a stored record into this in-transit state.
    ///
    /// The record is committed against this state, so its hash must match the expected hash.
    pub fn load<R: io::Read>(&mut self, reader: R) -> Result<(), StateError> {
        let record: Record = serde_json::from_reader(reader)?;
        let hash = BASE64_STANDARD.decode(record.hash.as_bytes())?;
        if record.offset > record.size {
            return Err(StateError::OffsetOutOfRange {
                offset: record.offset,
                size: record.size,
            });
        }
        self.commit(&record.mediatype, &hash)?;
        self.offset = record.offset;
        self.size = record.size;
        Ok(())
    }

    /// Describe the resource at the address' location with one GET through `node`.
    ///
    /// The address method must be GET. The response must carry a `Content-Length`.
    #[tracing::instrument(level = "debug", skip_all, fields(address = ?address.location().ok()))]
    pub async fn fetch(node: &Node, address: &Address, hash: &HashFn) -> Result<Self, NodeError> {
        let (method, location) = address.api_location()?;
        if method != Method::GET {
            return Err(NodeError::MethodNotAllowed(method));
        }

        let response = node.client().get(location).send().await?;
        if !response.status().is_success() {
            return Err(NodeError::Status(response.status()));
        }

        let media_type = header(response.headers(), http::header::CONTENT_TYPE)?.to_owned();
        let size = header(response.headers(), http::header::CONTENT_LENGTH)?
            .parse::<u64>()
            .map_err(|_| NodeError::InvalidHeader(http::header::CONTENT_LENGTH))?;

        let content = response
            .into_body()
            .collect()
            .await
            .map_err(|err| NodeError::Body(err.into()))?
            .to_bytes();

        Ok(Self {
            media_type,
            offset: content.len() as u64,
            size,
            hash: hash(&content[..])?,
        })
    }
}

fn header(headers: &http::HeaderMap, name: http::HeaderName) -> Result<&str, NodeError> {
    headers
        .get(&name)
        .ok_or_else(|| NodeError::MissingHeader(name.clone()))?
        .to_str()
        .map_err(|_| NodeError::InvalidHeader(name))
}
