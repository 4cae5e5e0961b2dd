//! The node protocol router.
//!
//! [`NodeTransport`] is a [`tower::Service`] over HTTP requests which dispatches on the URI
//! scheme:
//!
//! - `http` / `https` go to a real (or mock) HTTP service.
//! - `api` drives the [`StreamDescriptor`] registered at the request path.
//! - `cache` POST stores the body in the [`Cache`]; GET reads it back.
//! - `file` reads from the cache.
//!
//! A request may carry a [`Scope`] in its extensions; otherwise each request gets a fresh
//! scope from the transport's session.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use blobcache::{Cache, CACHE_SCHEME};
use futures::future::BoxFuture;
use futures::TryStreamExt as _;
use http::header::{HeaderName, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::{Method, StatusCode};
use http_body::Frame;
use http_body_util::{BodyExt as _, StreamBody};
use hyperdriver::body::{Request, Response};
use hyperdriver::client::SharedClientService;
use hyperdriver::service::SharedService;
use hyperdriver::Body;
use parking_lot::RwLock;
use tokio_util::io::{ReaderStream, StreamReader};
use transit::{Scope, Session, StableDescriptor, TransitError};
use url::Url;

use crate::address::Address;
use crate::error::{NodeError, NodeResult};
use crate::stream::StreamDescriptor;
use crate::uri::to_url;

/// Response header carrying `offset, expected, progress` for `api` requests.
pub const TRANSFER_POSITION: &str = "transfer-position";

/// Request header on a `cache` POST which continues an earlier, failed upload at this
/// byte offset.
pub const UPLOAD_OFFSET: &str = "upload-offset";

pub(crate) const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Routes requests across the node's schemes.
///
/// Clones share the cache, the registered APIs and the HTTP services.
#[derive(Clone)]
pub struct NodeTransport {
    session: Session,
    cache: Cache,
    apis: Arc<RwLock<HashMap<String, StreamDescriptor>>>,
    http: Option<SharedClientService<Body>>,
    https: Option<SharedClientService<Body>>,
}

impl fmt::Debug for NodeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTransport")
            .field("cache", &self.cache.name())
            .field("apis", &self.apis.read().keys().collect::<Vec<_>>())
            .field("http", &self.http.is_some())
            .field("https", &self.https.is_some())
            .finish()
    }
}

impl NodeTransport {
    /// A transport over `cache`, without any real HTTP delivery.
    pub fn new(session: Session, cache: Cache) -> Self {
        Self {
            session,
            cache,
            apis: Default::default(),
            http: None,
            https: None,
        }
    }

    /// A transport with a cache named `name` under the user cache directory, a session
    /// configured from the environment, and TCP/TLS delivery for `http` and `https`.
    pub async fn in_user_cache_dir(name: &str, ttl: Duration) -> NodeResult<Self> {
        let cache = Cache::in_user_cache_dir(name, ttl).await?;
        Ok(Self::new(Session::from_env(), cache).with_default_http())
    }

    /// Deliver `http` requests with `service`.
    pub fn with_http_service<S>(mut self, service: S) -> Self
    where
        S: tower::Service<Request, Response = Response, Error = hyperdriver::client::Error>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.http = Some(shared(service));
        self
    }

    /// Deliver `https` requests with `service`.
    pub fn with_https_service<S>(mut self, service: S) -> Self
    where
        S: tower::Service<Request, Response = Response, Error = hyperdriver::client::Error>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.https = Some(shared(service));
        self
    }

    /// Deliver `http` and `https` requests over TCP, with the default TLS configuration.
    pub fn with_default_http(mut self) -> Self {
        let client = hyperdriver::Client::build_tcp_http()
            .with_default_tls()
            .build_service();
        self.http = Some(client.clone());
        self.https = Some(client);
        self
    }

    /// The session scopes are created from.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The cache behind `cache` and `file` requests.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Serve `stream` at the path of the address' API root.
    pub fn add_api(&self, address: &Address, stream: StreamDescriptor) -> NodeResult<()> {
        let path = address.api_root()?.path().to_owned();
        tracing::debug!(%path, "registering api");
        if self.apis.write().insert(path.clone(), stream).is_some() {
            tracing::debug!(%path, "replaced api");
        }
        Ok(())
    }

    /// Stop serving the API at `path`.
    pub fn remove_api(&self, path: &str) -> Option<StreamDescriptor> {
        self.apis.write().remove(path)
    }

    /// The stream served at `path`, if any.
    pub fn api(&self, path: &str) -> Option<StreamDescriptor> {
        self.apis.read().get(path).cloned()
    }

    /// Resolve a `cache://` URL to a stable descriptor.
    pub fn source(&self, scope: &Scope, url: &Url) -> NodeResult<StableDescriptor> {
        Ok(self.cache.source(scope, url)?.into_stable())
    }

    /// Route one request.
    #[tracing::instrument(level = "debug", skip_all, fields(method = %req.method(), uri = %req.uri()))]
    pub async fn round_trip(&self, req: Request) -> NodeResult<Response> {
        let scope = req
            .extensions()
            .get::<Scope>()
            .cloned()
            .unwrap_or_else(|| self.session.scope());

        let scheme = req.uri().scheme_str().map(str::to_owned);
        match scheme.as_deref() {
            Some("http") => deliver(self.http.as_ref(), "http", req).await,
            Some("https") => deliver(self.https.as_ref(), "https", req).await,
            Some("api") => self.api_request(&scope, req).await,
            Some(CACHE_SCHEME) if req.method() == Method::POST => {
                self.cache_post(&scope, req).await
            }
            Some(CACHE_SCHEME) | Some("file") => self.cache_get(req).await,
            scheme => Err(NodeError::ProtocolNotImplemented(
                scheme.unwrap_or_default().to_owned(),
            )),
        }
    }

    async fn api_request(&self, scope: &Scope, req: Request) -> NodeResult<Response> {
        let path = req.uri().path().to_owned();
        let stream = self
            .api(&path)
            .ok_or_else(|| NodeError::UnknownApi(path.clone()))?;

        let mut destination = to_url(req.uri())?;
        destination
            .set_scheme(CACHE_SCHEME)
            .map_err(|_| NodeError::ProtocolNotImplemented(CACHE_SCHEME.to_owned()))?;
        stream.set_location(destination);

        match stream.should_transition(scope)?.await {
            Ok(()) => {}
            Err(TransitError::Interrupted(incomplete)) => {
                tracing::debug!(%path, current = incomplete.current(), "transition interrupted");
            }
            Err(err) => return Err(err.into()),
        }

        let position = stream.position();
        tracing::trace!(%path, %position, "api transition settled");
        let mut response = http::Response::builder()
            .status(StatusCode::OK)
            .header(TRANSFER_POSITION, position.to_string())
            .body(Body::empty())?;
        response.extensions_mut().insert(position);
        Ok(response)
    }

    async fn cache_post(&self, scope: &Scope, req: Request) -> NodeResult<Response> {
        let host = req.uri().host().ok_or(NodeError::MissingHost)?;
        if host != self.cache.name() {
            return Err(NodeError::IncorrectHost(host.to_owned()));
        }

        let path = req.uri().path().to_owned();
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .map(|value| {
                value
                    .to_str()
                    .map_err(|_| NodeError::InvalidHeader(CONTENT_TYPE))
            })
            .transpose()?
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_owned();

        let offset = req
            .headers()
            .get(UPLOAD_OFFSET)
            .map(|value| {
                value
                    .to_str()
                    .ok()
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .ok_or(NodeError::InvalidHeader(HeaderName::from_static(UPLOAD_OFFSET)))
            })
            .transpose()?
            .unwrap_or(0);

        let body = req.into_body().into_data_stream().map_err(io::Error::other);
        let reader = StreamReader::new(Box::pin(body));
        let descriptor = if offset > 0 {
            tracing::debug!(%path, offset, "resuming cache upload");
            self.cache
                .resume(scope, &path, &content_type, offset, reader)
                .await?
        } else {
            self.cache
                .cache(scope, &path, &content_type, reader)
                .await?
        };
        let location = self.cache.url(&path)?;

        Ok(http::Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(CONTENT_LENGTH, descriptor.info().size)
            .header(CONTENT_TYPE, content_type.as_str())
            .header(LOCATION, location.as_str())
            .body(Body::empty())?)
    }

    async fn cache_get(&self, req: Request) -> NodeResult<Response> {
        if req.method() != Method::GET {
            return Err(NodeError::ReadOnly);
        }

        let path = req.uri().path();
        let info = self.cache.stat(path)?;
        let file = self.cache.open(path).await?;
        let frames = ReaderStream::new(file).map_ok(Frame::data);

        let content_type = info.media_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
        Ok(http::Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, info.size)
            .body(Body::new(StreamBody::new(frames)))?)
    }
}

fn shared<S>(service: S) -> SharedClientService<Body>
where
    S: tower::Service<Request, Response = Response, Error = hyperdriver::client::Error>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    tower::ServiceBuilder::new()
        .layer(SharedService::layer())
        .service(service)
}

async fn deliver(
    service: Option<&SharedClientService<Body>>,
    scheme: &'static str,
    req: Request,
) -> NodeResult<Response> {
    use tower::ServiceExt as _;

    let service = service.cloned().ok_or(NodeError::NoTransport(scheme))?;
    Ok(service.oneshot(req).await?)
}

impl tower::Service<Request> for NodeTransport {
    type Response = Response;
    type Error = NodeError;
    type Future = BoxFuture<'static, Result<Response, NodeError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let transport = self.clone();
        Box::pin(async move { transport.round_trip(req).await })
    }
}

/// Collect a response body.
pub(crate) async fn collect(response: Response) -> NodeResult<bytes::Bytes> {
    Ok(response
        .into_body()
        .collect()
        .await
        .map_err(|err| NodeError::Body(err.into()))?
        .to_bytes())
}

#[cfg(test)]
mod tests {
    use blobcache::CacheErrorKind;
    use bytes::Bytes;
    use camino::Utf8PathBuf;

    use super::*;

    async fn transport(dir: &tempfile::TempDir) -> NodeTransport {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let cache = Cache::new(root, "localhost", Duration::from_secs(600))
            .await
            .unwrap();
        NodeTransport::new(Session::default(), cache)
    }

    fn request(method: Method, uri: &str, body: Body) -> Request {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(&dir).await;
        let err = transport
            .round_trip(request(Method::GET, "gopher://localhost/x", Body::empty()))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::ProtocolNotImplemented(scheme) if scheme == "gopher"));
    }

    #[tokio::test]
    async fn files_are_readonly() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(&dir).await;
        let err = transport
            .round_trip(request(Method::PUT, "file://localhost/x", Body::empty()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "node files are readonly");
    }

    #[tokio::test]
    async fn cache_post_checks_host() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(&dir).await;
        let err = transport
            .round_trip(request(
                Method::POST,
                "cache://elsewhere/x",
                Body::from(Bytes::from_static(b"content")),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::IncorrectHost(host) if host == "elsewhere"));
    }

    #[tokio::test]
    async fn upload_offset_must_match_kept_content() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(&dir).await;

        let mut req = request(
            Method::POST,
            "cache://localhost/x",
            Body::from(Bytes::from_static(b"content")),
        );
        req.headers_mut()
            .insert(UPLOAD_OFFSET, "soon".parse().unwrap());
        let err = transport.round_trip(req).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidHeader(name) if name == UPLOAD_OFFSET));

        let mut req = request(
            Method::POST,
            "cache://localhost/x",
            Body::from(Bytes::from_static(b"tent")),
        );
        req.headers_mut().insert(UPLOAD_OFFSET, "3".parse().unwrap());
        let err = transport.round_trip(req).await.unwrap_err();
        assert!(
            matches!(&err, NodeError::Cache(err) if err.kind() == CacheErrorKind::OffsetMismatch)
        );
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let response = transport
            .round_trip(request(Method::GET, "cache://localhost/x", Body::empty()))
            .await;
        assert!(response.is_err());
    }

    #[tokio::test]
    async fn missing_entries_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(&dir).await;
        let err = transport
            .round_trip(request(Method::GET, "cache://localhost/nothing", Body::empty()))
            .await
            .unwrap_err();
        assert!(matches!(&err, NodeError::Cache(err) if err.kind() == CacheErrorKind::NotFound));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_api() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(&dir).await;
        let err = transport
            .round_trip(request(Method::GET, "api://localhost/v2/blobs", Body::empty()))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::UnknownApi(path) if path == "/v2/blobs"));
    }

    #[tokio::test]
    async fn http_requires_a_service() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(&dir).await;
        let err = transport
            .round_trip(request(Method::GET, "http://example.com/", Body::empty()))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::NoTransport("http")));
    }
}
