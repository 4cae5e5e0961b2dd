//! Transition functions which deliver content through a node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blobcache::CACHE_SCHEME;
use futures::TryStreamExt as _;
use http::header::{CONTENT_TYPE, LOCATION};
use http_body::Frame;
use http_body_util::StreamBody;
use hyperdriver::Body;
use tokio_util::io::ReaderStream;
use transit::{Scope, StableDescriptor, StableReader, TransitError, TransitionFuture};
use url::Url;

use crate::error::NodeError;
use crate::node::Node;
use crate::transport::UPLOAD_OFFSET;

/// A transition which streams the source content as a POST to the `cache://` form of the
/// destination, and resolves the returned `Location` back into a stable descriptor.
///
/// If the source suffers an outage part way through, the cache keeps what it received and
/// the transition reports an interruption at that offset. The next attempt resumes the
/// source there and sends only the rest, marked with an `upload-offset` header.
pub fn write_cache(
    node: &Node,
    media_type: impl Into<String>,
) -> impl Fn(Scope, Url, StableReader) -> TransitionFuture + Send + Sync + 'static {
    let client = node.client();
    let transport = node.transport().clone();
    let media_type: String = media_type.into();

    move |scope: Scope, location: Url, reader: StableReader| -> TransitionFuture {
        let client = client.clone();
        let transport = transport.clone();
        let media_type = media_type.clone();

        Box::pin(async move {
            let location = cache_location(location)?;
            let source = reader.descriptor().clone();
            let start = reader.offset();
            let sent = Arc::new(AtomicU64::new(0));

            let mut request = client
                .post(location)
                .header(CONTENT_TYPE, media_type.as_str())
                .body(streaming_body(reader, Arc::clone(&sent)))
                .scope(scope.clone());
            if start > 0 {
                tracing::debug!(start, "resuming upload");
                request = request.header(UPLOAD_OFFSET, start.to_string());
            }

            let response = match request
                .send()
                .await
                .and_then(|response| response.error_for_status())
            {
                Ok(response) => response,
                Err(err) => {
                    let delivered = start + sent.load(Ordering::SeqCst);
                    return Err(interrupted(&scope, &source, delivered).unwrap_or_else(|| {
                        TransitError::other(err)
                    }));
                }
            };

            let location = response
                .location()
                .map_err(TransitError::other)?
                .ok_or_else(|| TransitError::other(NodeError::MissingHeader(LOCATION)))?;
            transport
                .source(&scope, &location)
                .map_err(TransitError::other)
        })
    }
}

fn streaming_body(reader: StableReader, sent: Arc<AtomicU64>) -> Body {
    let stream = ReaderStream::new(reader)
        .inspect_ok(move |chunk| {
            sent.fetch_add(chunk.len() as u64, Ordering::SeqCst);
        })
        .map_ok(Frame::data);
    Body::new(StreamBody::new(stream))
}

/// Turn an outage of `source` into an interruption at the offset the destination holds.
fn interrupted(scope: &Scope, source: &StableDescriptor, delivered: u64) -> Option<TransitError> {
    let Some(TransitError::TemporaryOutage(outage)) = source.error() else {
        return None;
    };
    if outage.current() != delivered {
        tracing::warn!(
            current = outage.current(),
            delivered,
            "source outage does not match the delivered content"
        );
        return Some(TransitError::PositionLost);
    }

    tracing::debug!(current = delivered, "source outage during transition");
    let session = scope.session();
    let cooldown = outage.cooldown().max(session.minimum_cooldown());
    Some(match session.interrupted_transition(delivered, cooldown) {
        Ok(interruption) => interruption.into(),
        Err(err) => err,
    })
}
