use std::time::Duration;

use blobcache::Cache;
use bytes::Bytes;
use camino::Utf8PathBuf;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::StatusCode;
use node::mock::MockService;
use node::{hash_fn, hash_xxh64, Address, BearerAuth, Node, NodeError, NodeTransport, State};
use transit::Session;

async fn node(dir: &tempfile::TempDir, address: Address) -> Node {
    let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
    let cache = Cache::new(root, "localhost", Duration::from_secs(600))
        .await
        .unwrap();
    Node::new(address, NodeTransport::new(Session::default(), cache))
}

#[tokio::test]
async fn cache_post_then_get() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(&dir, Address::new()).await;
    let client = node.client();

    let response = client
        .post("cache://localhost/library/blob")
        .header(CONTENT_TYPE, "text/plain")
        .body(Bytes::from_static(b"hello, node"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()[CONTENT_LENGTH], "11");
    assert_eq!(response.headers()[LOCATION], "cache://localhost/library/blob");
    assert_eq!(
        response.location().unwrap().unwrap().as_str(),
        "cache://localhost/library/blob"
    );

    for url in ["cache://localhost/library/blob", "file://localhost/library/blob"] {
        let response = client.get(url).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(response.headers()[CONTENT_LENGTH], "11");
        assert_eq!(response.text().await.unwrap(), "hello, node");
    }
}

#[tokio::test]
async fn cache_files_cannot_be_overwritten_with_put() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(&dir, Address::new()).await;
    let err = node
        .client()
        .put("file://localhost/library/blob")
        .body(Bytes::from_static(b"nope"))
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::ReadOnly));
    assert_eq!(err.status_code(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn unknown_schemes_are_not_implemented() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(&dir, Address::new()).await;
    let err = node
        .client()
        .get("gopher://localhost/hole")
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::ProtocolNotImplemented(scheme) if scheme == "gopher"));
}

#[tokio::test]
async fn https_goes_through_the_configured_service() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
    let cache = Cache::new(root, "localhost", Duration::from_secs(600))
        .await
        .unwrap();

    let mut mock = MockService::new();
    let mut headers = http::HeaderMap::new();
    headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
    mock.add(
        "/v2/library/ubuntu",
        StatusCode::OK,
        headers,
        Bytes::from_static(br#"{"ok":true}"#),
    );

    let transport = NodeTransport::new(Session::default(), cache).with_https_service(mock.clone());
    let address = Address::new();
    address
        .set_host("registry.test")
        .set_root("v2")
        .set_namespace("library/ubuntu");
    let node = Node::new(address, transport).with_authorizer(BearerAuth::new("token"));

    let request = node.secure_request(None).unwrap();
    let response = node.client().execute(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), r#"{"ok":true}"#);

    let missing = node
        .client()
        .get("https://registry.test/v2/elsewhere")
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert!(matches!(
        missing.error_for_status(),
        Err(NodeError::Status(StatusCode::NOT_FOUND))
    ));

    let requests = mock.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].headers[AUTHORIZATION], "Bearer token");
    assert!(requests[1].headers.get(AUTHORIZATION).is_none());
}

#[tokio::test]
async fn http_without_a_service_fails() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(&dir, Address::new()).await;
    let err = node
        .client()
        .get("http://localhost/anything")
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::NoTransport("http")));
}

#[tokio::test]
async fn state_round_trips_through_storage() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(&dir, Address::new()).await;
    let content = Bytes::from_static(b"layer contents, compressed or not");
    node.client()
        .post("cache://localhost/library/layer")
        .header(CONTENT_TYPE, "application/vnd.oci.image.layer.v1.tar")
        .body(content.clone())
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let address = Address::new();
    address
        .set_protocol("cache")
        .set_host("localhost")
        .set_root("library")
        .set_term("layer");
    let hash = hash_fn(hash_xxh64);
    let state = State::fetch(&node, &address, &hash).await.unwrap();
    state.is_stable().unwrap();
    assert_eq!(state.media_type(), "application/vnd.oci.image.layer.v1.tar");
    assert_eq!(state.size(), content.len() as u64);
    assert_eq!(state.hash(), hash_xxh64(&content).unwrap().as_slice());

    let mut stored = Vec::new();
    state.store(&mut stored).unwrap();

    let mut loaded = State::start(0, state.hash().to_vec());
    loaded.load(stored.as_slice()).unwrap();
    loaded.is_stable().unwrap();
    assert_eq!(loaded, state);

    address.set_method("POST");
    let err = State::fetch(&node, &address, &hash).await.unwrap_err();
    assert!(matches!(err, NodeError::MethodNotAllowed(method) if method == http::Method::POST));
}
