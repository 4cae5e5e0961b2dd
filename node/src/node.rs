//! Nodes and their HTTP-shaped client.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, LOCATION};
use http::{Method, Uri};
use hyperdriver::Body;
use tower::ServiceExt as _;
use transit::{Position, Scope, TransitError};
use url::Url;

use crate::address::Address;
use crate::auth::Authorize;
use crate::error::{NodeError, NodeResult};
use crate::transport::{collect, NodeTransport};
use crate::uri::{IntoUri, ParseUriError};

/// A base address together with the transport that serves it.
///
/// Clones share the address, the transport and the authorizer.
#[derive(Clone)]
pub struct Node {
    address: Arc<Address>,
    transport: NodeTransport,
    authorizer: Option<Arc<dyn Authorize>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("transport", &self.transport)
            .field("authorizer", &self.authorizer.is_some())
            .finish()
    }
}

impl Node {
    /// Create a node. An address without a host takes the transport's cache name.
    pub fn new(address: Address, transport: NodeTransport) -> Self {
        if address.host().is_empty() {
            address.set_host(transport.cache().name());
        }
        Self {
            address: Arc::new(address),
            transport,
            authorizer: None,
        }
    }

    /// Sign secure requests with `authorizer`.
    pub fn with_authorizer<A>(mut self, authorizer: A) -> Self
    where
        A: Authorize + 'static,
    {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// The node's base address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The transport requests are routed through.
    pub fn transport(&self) -> &NodeTransport {
        &self.transport
    }

    /// A client whose requests are routed through this node's transport.
    pub fn client(&self) -> NodeClient {
        NodeClient {
            transport: self.transport.clone(),
        }
    }

    /// A signed request to the address' `https` root.
    ///
    /// GET without a body, POST with one.
    pub fn secure_request(&self, body: Option<Body>) -> NodeResult<hyperdriver::body::Request> {
        let authorizer = self.authorizer.as_ref().ok_or(NodeError::NoAuthorizer)?;
        let (mut parts, body) = self.address.https_request(body)?.into_parts();
        authorizer.authorize(&mut parts)?;
        Ok(http::Request::from_parts(parts, body))
    }
}

/// Sends requests through a [`NodeTransport`].
#[derive(Debug, Clone)]
pub struct NodeClient {
    transport: NodeTransport,
}

impl NodeClient {
    /// A GET request.
    pub fn get<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::GET, uri)
    }

    /// A POST request.
    pub fn post<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::POST, uri)
    }

    /// A PUT request.
    pub fn put<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::PUT, uri)
    }

    /// A request with any method.
    pub fn request<U: IntoUri>(&self, method: Method, uri: U) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, uri.into_uri())
    }

    /// Send a prepared request.
    pub async fn execute(&self, req: hyperdriver::body::Request) -> NodeResult<NodeResponse> {
        let parts = request_parts(&req);
        let response = self.transport.clone().oneshot(req).await?;
        Ok(NodeResponse::new(parts, response))
    }
}

fn request_parts<B>(req: &http::Request<B>) -> http::request::Parts {
    let (mut parts, ()) = http::Request::new(()).into_parts();
    parts.method = req.method().clone();
    parts.uri = req.uri().clone();
    parts.version = req.version();
    parts.headers = req.headers().clone();
    parts
}

/// A request being prepared by a [`NodeClient`].
#[derive(Debug)]
pub struct RequestBuilder {
    client: NodeClient,
    uri: Result<Uri, ParseUriError>,
    req: http::request::Builder,
    body: Option<Body>,
    timeout: Option<Duration>,
}

impl RequestBuilder {
    fn new(client: NodeClient, method: Method, uri: Result<Uri, ParseUriError>) -> Self {
        Self {
            client,
            uri,
            req: http::Request::builder().method(method),
            body: None,
            timeout: None,
        }
    }

    /// Add a header.
    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.req = self.req.header(key, value);
        self
    }

    /// Set the body.
    pub fn body<B: Into<Body>>(self, body: B) -> Self {
        Self {
            body: Some(body.into()),
            ..self
        }
    }

    /// Run the request in `scope` instead of a fresh session scope.
    pub fn scope(mut self, scope: Scope) -> Self {
        self.req = self.req.extension(scope);
        self
    }

    /// Fail if no response arrives within `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send the request.
    pub async fn send(self) -> NodeResult<NodeResponse> {
        let req = self
            .req
            .uri(self.uri?)
            .body(self.body.unwrap_or_else(Body::empty))?;

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.client.execute(req))
                .await
                .map_err(|_| NodeError::Transit(TransitError::DeadlineExceeded))?,
            None => self.client.execute(req).await,
        }
    }
}

/// A response, with the parts of the request which produced it.
#[derive(Debug)]
pub struct NodeResponse {
    request: http::request::Parts,
    response: http::response::Parts,
    body: Body,
}

impl NodeResponse {
    fn new(request: http::request::Parts, response: hyperdriver::body::Response) -> Self {
        let (response, body) = response.into_parts();
        Self {
            request,
            response,
            body,
        }
    }

    /// The response status.
    pub fn status(&self) -> http::StatusCode {
        self.response.status
    }

    /// The response headers.
    pub fn headers(&self) -> &http::HeaderMap {
        &self.response.headers
    }

    /// The URI that was requested.
    pub fn uri(&self) -> &Uri {
        &self.request.uri
    }

    /// The `Location` header as a URL.
    pub fn location(&self) -> NodeResult<Option<Url>> {
        let Some(location) = self.headers().get(LOCATION) else {
            return Ok(None);
        };
        let location = location
            .to_str()
            .map_err(|_| NodeError::InvalidHeader(LOCATION))?;
        Ok(Some(
            Url::parse(location).map_err(|_| NodeError::InvalidHeader(LOCATION))?,
        ))
    }

    /// The transfer position reported by an `api` request.
    pub fn position(&self) -> Option<&Position> {
        self.response.extensions.get::<Position>()
    }

    /// Fail with the status code unless it is a success.
    pub fn error_for_status(self) -> NodeResult<Self> {
        if self.status().is_success() {
            Ok(self)
        } else {
            Err(NodeError::Status(self.status()))
        }
    }

    /// Take the body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Reassemble the HTTP response.
    pub fn into_response(self) -> hyperdriver::body::Response {
        http::Response::from_parts(self.response, self.body)
    }

    /// Collect the body.
    pub async fn bytes(self) -> NodeResult<Bytes> {
        collect(self.into_response()).await
    }

    /// Collect the body as UTF-8 text.
    pub async fn text(self) -> NodeResult<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|err| NodeError::Body(err.into()))
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use transit::Session;

    use super::*;
    use crate::auth::BearerAuth;

    async fn node(dir: &tempfile::TempDir, address: Address) -> Node {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let cache = blobcache::Cache::new(root, "localhost", Duration::from_secs(600))
            .await
            .unwrap();
        Node::new(address, NodeTransport::new(Session::default(), cache))
    }

    #[tokio::test]
    async fn empty_host_takes_cache_name() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::from_node_locator("v2://blobs/uploads").unwrap();
        let node = node(&dir, address).await;
        assert_eq!(node.address().host(), "localhost");
        assert_eq!(
            node.address().https_root().unwrap().as_str(),
            "https://localhost/v2/blobs/uploads"
        );
    }

    #[tokio::test]
    async fn secure_requests_need_an_authorizer() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(&dir, Address::new()).await;
        let err = node.secure_request(None).unwrap_err();
        assert!(matches!(err, NodeError::NoAuthorizer));

        let node = node.with_authorizer(BearerAuth::new("token"));
        let request = node.secure_request(None).unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.headers()[http::header::AUTHORIZATION], "Bearer token");
    }

    #[tokio::test]
    async fn invalid_uris_fail_on_send() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(&dir, Address::new()).await;
        let err = node.client().get("not a url").send().await.unwrap_err();
        assert!(matches!(err, NodeError::Uri(_)));
    }

    #[test]
    fn futures_are_send() {
        fn assert_send<T: Send>(_t: T) {}
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let node = rt.block_on(node(&dir, Address::new()));
        assert_send(node.client().get("cache://localhost/x").send());
    }
}
