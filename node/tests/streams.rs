use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blobcache::Cache;
use bytes::Bytes;
use camino::Utf8PathBuf;
use http::header::CONTENT_TYPE;
use http::StatusCode;
use node::{
    hash_fn, hash_xxh64, write_cache, Address, Node, NodeError, NodeTransport, StreamDescriptor,
    TRANSFER_POSITION,
};
use tokio::io::AsyncReadExt as _;
use tokio_util::io::StreamReader;
use transit::{
    Session, SessionConfig, StableDescriptor, TransientDescriptor, TransitError, TransitionFuture,
};
use url::Url;

const MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

struct Fixture {
    _dir: tempfile::TempDir,
    node: Node,
    address: Address,
    content: Bytes,
}

async fn fixture() -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
    let cache = Cache::new(root, "localhost", Duration::from_secs(600))
        .await
        .unwrap();
    let session = Session::new(SessionConfig {
        minimum_cooldown: Duration::from_millis(10),
        ..SessionConfig::default()
    });
    let address = Address::from_node_locator("v2://blobs/uploads").unwrap();
    let node = Node::new(address.clone(), NodeTransport::new(session, cache));

    let content: Bytes = (0..64 * 1024u32).map(|i| (i % 253) as u8).collect();
    node.client()
        .post("cache://localhost/library/layer")
        .header(CONTENT_TYPE, MEDIA_TYPE)
        .body(content.clone())
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    Fixture {
        _dir: dir,
        address: node.address().clone(),
        node,
        content,
    }
}

async fn stream(fixture: &Fixture) -> StreamDescriptor {
    let address = fixture.address.clone();
    StreamDescriptor::create(
        &fixture.node,
        move || {
            let location = Url::parse("cache://localhost/library/layer").unwrap();
            Ok((address, location))
        },
        hash_xxh64(&fixture.content).unwrap(),
        hash_fn(hash_xxh64),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn api_request_completes_the_transfer() {
    let fixture = fixture().await;
    let stream = stream(&fixture).await;
    let size = fixture.content.len() as u64;

    let state = stream.state();
    state.is_stable().unwrap();
    assert_eq!(state.media_type(), MEDIA_TYPE);
    assert_eq!(state.size(), size);

    let position = stream.position();
    assert_eq!((position.offset, position.expected), (0, size));
    assert_eq!(position.progress, 0.0);

    let transport = fixture.node.transport();
    transport.add_api(&fixture.address, stream.clone()).unwrap();

    let api = fixture.address.api(["GET"]).unwrap();
    assert_eq!(api.as_str(), "api://localhost/v2/blobs/uploads?method=GET");
    let response = fixture.node.client().get(&api).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[TRANSFER_POSITION],
        format!("{size}, {size}, 1").as_str()
    );
    let position = response.position().unwrap();
    assert!(position.is_complete());

    let delivered = fixture
        .node
        .client()
        .get("cache://localhost/v2/blobs/uploads")
        .send()
        .await
        .unwrap();
    assert_eq!(delivered.headers()[CONTENT_TYPE], MEDIA_TYPE);
    assert_eq!(delivered.bytes().await.unwrap(), fixture.content);

    let mut source = Vec::new();
    stream
        .source()
        .unwrap()
        .open()
        .await
        .unwrap()
        .read_to_end(&mut source)
        .await
        .unwrap();
    assert_eq!(source, fixture.content);

    let err = fixture.node.client().get(&api).send().await.unwrap_err();
    assert!(matches!(
        err,
        NodeError::Transit(TransitError::AlreadyComplete)
    ));
}

#[tokio::test]
async fn interrupted_transfer_resumes_on_the_next_request() {
    let fixture = fixture().await;
    let stream = stream(&fixture).await;
    let size = fixture.content.len() as u64;
    fixture
        .node
        .transport()
        .add_api(&fixture.address, stream.clone())
        .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let deliver = write_cache(&fixture.node, MEDIA_TYPE);
    {
        let attempts = Arc::clone(&attempts);
        stream
            .transient()
            .set_transition(move |scope, location, reader| -> TransitionFuture {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    drop(reader);
                    return Box::pin(async move {
                        let interruption = scope
                            .session()
                            .interrupted_transition(1024, Duration::from_millis(10))?;
                        Err(interruption.into())
                    });
                }
                deliver(scope, location, reader)
            });
    }

    let api = fixture.address.api_root().unwrap();
    let response = fixture.node.client().get(&api).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let position = response.position().unwrap().clone();
    assert_eq!((position.offset, position.expected), (1024, size));
    assert!(!position.is_complete());
    assert!(position.error.is_none());

    let response = fixture.node.client().get(&api).send().await.unwrap();
    let position = response.position().unwrap();
    assert!(position.is_complete());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let delivered = fixture
        .node
        .client()
        .get("cache://localhost/v2/blobs/uploads")
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(delivered, fixture.content);
}

#[tokio::test]
async fn update_accepts_confirmed_content() {
    let fixture = fixture().await;
    let stream = stream(&fixture).await;
    let scope = fixture.node.transport().session().scope();
    let checksum = hash_xxh64(&fixture.content).unwrap();

    stream.set_accepts("text/plain");
    let err = stream.update(&scope, MEDIA_TYPE, &checksum).unwrap_err();
    assert!(matches!(err, NodeError::Unacceptable(media) if media == MEDIA_TYPE));

    stream.set_accepts(format!("text/plain, {MEDIA_TYPE}"));
    stream.update(&scope, MEDIA_TYPE, &checksum).unwrap();
    assert_eq!(stream.position().offset, 0);

    stream
        .should_transition(&scope)
        .unwrap()
        .await
        .unwrap();
    stream.update(&scope, MEDIA_TYPE, &checksum).unwrap();
    let state = stream.state();
    state.is_stable().unwrap();
    assert_eq!(state.hash(), checksum.as_slice());
    assert!(stream.source().unwrap().is_stable().is_ok());

    let err = stream.update(&scope, MEDIA_TYPE, &[]).unwrap_err();
    assert!(matches!(err, NodeError::State(node::StateError::ZeroHash)));
}

#[tokio::test]
async fn hash_mismatch_fails_creation() {
    let fixture = fixture().await;
    let address = fixture.address.clone();
    let err = StreamDescriptor::create(
        &fixture.node,
        move || {
            let location = Url::parse("cache://localhost/library/layer").unwrap();
            Ok((address, location))
        },
        vec![0u8; 8],
        hash_fn(hash_xxh64),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, NodeError::State(_)));
}

#[tokio::test]
async fn unregistered_apis_are_unknown() {
    let fixture = fixture().await;
    let err = fixture
        .node
        .client()
        .get("api://localhost/v2/blobs/uploads")
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::UnknownApi(path) if path == "/v2/blobs/uploads"));
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn source_outage_resumes_the_upload_where_it_stopped() {
    let fixture = fixture().await;
    let session = fixture.node.transport().session().clone();
    let scope = session.scope();
    let size = fixture.content.len() as u64;
    let head = fixture.content.slice(..20_000);

    let opened = Arc::new(AtomicUsize::new(0));
    let source = {
        let session = session.clone();
        let opened = Arc::clone(&opened);
        let content = fixture.content.clone();
        StableDescriptor::resumable(
            &scope,
            size,
            move || {
                opened.fetch_add(1, Ordering::SeqCst);
                let outage = session.temporary_outage(head.len() as u64, Duration::from_millis(10));
                let chunks = vec![
                    Ok(head.clone()),
                    Err(io::Error::from(TransitError::TemporaryOutage(outage))),
                ];
                async move { Ok(StreamReader::new(futures::stream::iter(chunks))) }
            },
            move || {
                let content = content.clone();
                async move { Ok(io::Cursor::new(content)) }
            },
        )
    };

    let transient = TransientDescriptor::new();
    transient.set_transition(write_cache(&fixture.node, MEDIA_TYPE));
    transient.set_source(source).unwrap();
    transient.set_location(Url::parse("cache://localhost/v2/blobs/uploads").unwrap());
    transient.set_expected(size).unwrap();

    let err = transient
        .should_transition(&scope)
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.is_interrupted(), "{err}");
    assert_eq!(transient.position().offset, 20_000);
    assert!(transient.error().is_none());
    assert_eq!(
        fixture.node.transport().cache().partial("v2/blobs/uploads"),
        Some(20_000)
    );
    err.settle().await;

    transient.should_transition(&scope).unwrap().await.unwrap();
    assert!(transient.position().is_complete());
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(
        fixture.node.transport().cache().partial("v2/blobs/uploads"),
        None
    );

    let delivered = fixture
        .node
        .client()
        .get("cache://localhost/v2/blobs/uploads")
        .send()
        .await
        .unwrap();
    assert_eq!(delivered.headers()[CONTENT_TYPE], MEDIA_TYPE);
    assert_eq!(delivered.bytes().await.unwrap(), fixture.content);
}
