//! Nodes: content addressed by URL, moved through a single protocol router.
//!
//! A [`Node`] pairs an [`Address`] with a [`NodeTransport`]. The transport routes requests by
//! URI scheme: `http`/`https` go out over the network, `cache` and `file` are served from the
//! local blob cache, and `api` drives the [`StreamDescriptor`] registered at the request path.
//!
//! A stream descriptor ties a remote resource's verified [`State`] to a resumable
//! [`transit::TransientDescriptor`], so delivering the resource into the cache survives
//! temporary outages of its source.

mod address;
mod auth;
mod config;
mod digest;
mod error;
mod node;
mod state;
mod stream;
mod transition;
mod transport;
mod uri;

pub use self::address::{Address, AddressError, AddressParts};
pub use self::auth::{basic_auth, Authorize, AuthorizeError, BasicAuth, BearerAuth};
pub use self::config::NodeConfig;
pub use self::digest::{hash_fn, hash_sha256, hash_xxh64, DigestError, HashFn};
pub use self::error::{NodeError, NodeResult};
pub use self::node::{Node, NodeClient, NodeResponse, RequestBuilder};
pub use self::state::{State, StateError, TRANSIENT_MEDIA_TYPE};
pub use self::stream::{StreamDescriptor, ACCEPT_ANY};
pub use self::transition::write_cache;
pub use self::transport::{NodeTransport, TRANSFER_POSITION, UPLOAD_OFFSET};
pub use self::uri::{IntoUri, ParseUriError};

/// Canned HTTP services for exercising the `http` and `https` routes without a network.
pub mod mock {
    use std::collections::HashMap;
    use std::sync::Arc;

    use bytes::Bytes;
    use parking_lot::Mutex;

    /// A canned response.
    #[derive(Debug, Clone)]
    pub struct MockResponse {
        status: http::StatusCode,
        headers: http::HeaderMap,
        body: Bytes,
    }

    impl MockResponse {
        /// A response with the given status, headers and body.
        pub fn new(
            status: http::StatusCode,
            headers: http::HeaderMap,
            body: impl Into<Bytes>,
        ) -> Self {
            Self {
                status,
                headers,
                body: body.into(),
            }
        }

        fn to_response(&self) -> hyperdriver::body::Response {
            let mut response = http::Response::new(hyperdriver::Body::from(self.body.clone()));
            *response.status_mut() = self.status;
            *response.version_mut() = http::Version::HTTP_11;
            *response.headers_mut() = self.headers.clone();
            response
        }
    }

    /// Answers requests by path. Unknown paths get `404 Not Found`.
    ///
    /// Clones share the responses and the request log.
    #[derive(Debug, Default, Clone)]
    pub struct MockService {
        responses: HashMap<String, MockResponse>,
        requests: Arc<Mutex<Vec<http::request::Parts>>>,
    }

    impl MockService {
        /// A service with no responses.
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer requests for `path`.
        pub fn add(
            &mut self,
            path: &str,
            status: http::StatusCode,
            headers: http::HeaderMap,
            body: impl Into<Bytes>,
        ) {
            let response = MockResponse::new(status, headers, body);
            self.responses.insert(path.to_owned(), response);
        }

        /// The heads of the requests received so far.
        pub fn requests(&self) -> Vec<http::request::Parts> {
            self.requests.lock().clone()
        }
    }

    impl tower::Service<hyperdriver::body::Request> for MockService {
        type Response = hyperdriver::body::Response;
        type Error = hyperdriver::client::Error;
        type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: hyperdriver::body::Request) -> Self::Future {
            let (parts, _) = req.into_parts();
            let response = match self.responses.get(parts.uri.path()) {
                Some(response) => response.to_response(),
                None => {
                    tracing::debug!(path = parts.uri.path(), "no mock response configured");
                    MockResponse::new(
                        http::StatusCode::NOT_FOUND,
                        http::HeaderMap::new(),
                        Bytes::new(),
                    )
                    .to_response()
                }
            };
            self.requests.lock().push(parts);
            std::future::ready(Ok(response))
        }
    }
}
