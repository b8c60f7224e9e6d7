//! Contract tests for `AzureBlobBackend` against a wiremock server.
//!
//! The mock server listens on a bare IPv4 address, so every URL is
//! path-style: `/<account>/<container>[/<blob>]`.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use wiremock::matchers::{
    body_bytes, header, header_exists, method, path, query_param, query_param_is_missing,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

use azblobfs::cadapter::azure::AzureBlobBackend;
use azblobfs::cadapter::client::{
    BlobBackend, ContainerAccess, MAX_BLOB_SIZE, MAX_BLOCK_SIZE, PutBlobOptions, StorageError,
};
use azblobfs::config::{DEV_ACCOUNT, DEV_KEY, StorageConfig};

const MODIFIED: &str = "Sun, 11 Oct 2009 21:49:13 GMT";

fn backend(server: &MockServer) -> Arc<AzureBlobBackend> {
    let host = server.uri().trim_start_matches("http://").to_string();
    let config = StorageConfig::new(DEV_ACCOUNT, DEV_KEY, Some(host));
    Arc::new(config.connect().unwrap())
}

fn blob_xml(names: &[&str], next_marker: Option<&str>) -> String {
    let blobs: String = names
        .iter()
        .map(|name| {
            format!(
                "<Blob><Name>{name}</Name><Properties>\
                 <Last-Modified>{MODIFIED}</Last-Modified>\
                 <Content-Length>{}</Content-Length>\
                 </Properties></Blob>",
                name.len()
            )
        })
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <EnumerationResults ContainerName=\"photos\"><Blobs>{blobs}</Blobs>\
         <NextMarker>{}</NextMarker></EnumerationResults>",
        next_marker.unwrap_or_default()
    )
}

// ── GET /?comp=list ──────────────────────────────────────────────────

#[tokio::test]
async fn list_containers_is_signed_and_parsed() {
    let server = MockServer::start().await;
    let body = format!(
        "\u{feff}<EnumerationResults><Containers>\
         <Container><Name>photos</Name><Properties><Last-Modified>{MODIFIED}</Last-Modified><Etag>\"0x1\"</Etag></Properties></Container>\
         <Container><Name>logs</Name><Properties><Last-Modified>{MODIFIED}</Last-Modified></Properties></Container>\
         </Containers><NextMarker/></EnumerationResults>"
    );
    Mock::given(method("GET"))
        .and(path(format!("/{DEV_ACCOUNT}/")))
        .and(query_param("comp", "list"))
        .and(header("x-ms-version", "2011-08-18"))
        .and(header_exists("x-ms-date"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let containers = backend(&server).list_containers().await.unwrap();
    let names: Vec<_> = containers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["photos", "logs"]);
    assert_eq!(containers[0].etag.as_deref(), Some("\"0x1\""));

    let requests = server.received_requests().await.unwrap();
    let auth = requests[0]
        .headers
        .get("authorization")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(auth.starts_with(&format!("SharedKey {DEV_ACCOUNT}:")));
}

// ── GET /<c>?restype=container&comp=list ─────────────────────────────

#[tokio::test]
async fn blob_listing_follows_next_marker() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/{DEV_ACCOUNT}/photos")))
        .and(query_param("restype", "container"))
        .and(query_param("comp", "list"))
        .and(query_param_is_missing("marker"))
        .respond_with(ResponseTemplate::new(200).set_body_string(blob_xml(&["a", "bb"], Some("m1"))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{DEV_ACCOUNT}/photos")))
        .and(query_param("marker", "m1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(blob_xml(&["ccc"], None)))
        .expect(1)
        .mount(&server)
        .await;

    let blobs = AzureBlobBackend::list_blobs(backend(&server), "photos", None)
        .collect_all()
        .await
        .unwrap();
    let listed: Vec<_> = blobs.iter().map(|b| (b.name.as_str(), b.size)).collect();
    assert_eq!(listed, vec![("a", 1), ("bb", 2), ("ccc", 3)]);
}

#[tokio::test]
async fn blob_listing_forwards_prefix() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/{DEV_ACCOUNT}/photos")))
        .and(query_param("prefix", "2024"))
        .respond_with(ResponseTemplate::new(200).set_body_string(blob_xml(&["2024-a"], None)))
        .expect(1)
        .mount(&server)
        .await;

    let blobs = AzureBlobBackend::list_blobs(backend(&server), "photos", Some("2024".into()))
        .collect_all()
        .await
        .unwrap();
    assert_eq!(blobs.len(), 1);
}

#[tokio::test]
async fn malformed_listing_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<EnumerationResults><Blobs>"))
        .mount(&server)
        .await;

    let err = backend(&server)
        .list_blobs_page("photos", None, None)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

// ── PUT /<c>?restype=container ───────────────────────────────────────

#[tokio::test]
async fn create_container_maps_conflict_and_public_access() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(format!("/{DEV_ACCOUNT}/fresh")))
        .and(query_param("restype", "container"))
        .and(header("content-length", "0"))
        .and(header("x-ms-prop-publicaccess", "true"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/{DEV_ACCOUNT}/taken")))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let client = backend(&server);
    client
        .create_container("fresh", ContainerAccess::Public)
        .await
        .unwrap();
    assert_eq!(
        client
            .create_container("taken", ContainerAccess::Private)
            .await,
        Err(StorageError::AlreadyExists)
    );
}

#[tokio::test]
async fn delete_container_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("/{DEV_ACCOUNT}/gone")))
        .and(query_param("restype", "container"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("/{DEV_ACCOUNT}/locked")))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("/{DEV_ACCOUNT}/old")))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let client = backend(&server);
    assert_eq!(client.delete_container("gone").await, Err(StorageError::NotFound));
    assert_eq!(client.delete_container("locked").await, Err(StorageError::Denied));
    client.delete_container("old").await.unwrap();
}

// ── blobs ────────────────────────────────────────────────────────────

#[tokio::test]
async fn put_blob_sends_block_blob_headers() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(format!("/{DEV_ACCOUNT}/photos/a%20b.txt")))
        .and(header("x-ms-blob-type", "BlockBlob"))
        .and(header("content-type", "text/plain"))
        .and(header("content-md5", "XrY7u+Ae7tCTyyK7j1rNww=="))
        .and(header("x-ms-meta-owner", "alice"))
        .and(header_exists("authorization"))
        .and(body_bytes(b"hello world".to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let options = PutBlobOptions {
        content_type: "text/plain".into(),
        metadata: BTreeMap::from([("owner".to_string(), "alice".to_string())]),
    };
    backend(&server)
        .put_blob("photos", "a b.txt", Bytes::from_static(b"hello world"), &options)
        .await
        .unwrap();
}

#[tokio::test]
async fn get_blob_with_metadata_strips_prefix() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/{DEV_ACCOUNT}/photos/cat.jpg")))
        .and(header_exists("authorization"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ms-meta-owner", "alice")
                .insert_header("x-ms-meta-camera", "x100")
                .insert_header("x-ms-blob-type", "BlockBlob")
                .set_body_bytes(b"jpeg".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let blob = backend(&server)
        .get_blob_with_metadata("photos", "cat.jpg")
        .await
        .unwrap();
    assert_eq!(&blob.data[..], b"jpeg");
    assert_eq!(
        blob.metadata,
        BTreeMap::from([
            ("camera".to_string(), "x100".to_string()),
            ("owner".to_string(), "alice".to_string()),
        ])
    );
}

#[tokio::test]
async fn put_block_stages_with_block_id() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(format!("/{DEV_ACCOUNT}/photos/big.bin")))
        .and(query_param("comp", "block"))
        .and(query_param("blockid", "YmxvY2stMDAwMQ=="))
        .and(header("content-length", "5"))
        .and(header_exists("authorization"))
        .and(body_bytes(b"chunk".to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/{DEV_ACCOUNT}/locked/big.bin")))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let client = backend(&server);
    client
        .put_block("photos", "big.bin", "YmxvY2stMDAwMQ==", Bytes::from_static(b"chunk"))
        .await
        .unwrap();
    assert_eq!(
        client
            .put_block("locked", "big.bin", "YmxvY2stMDAwMQ==", Bytes::from_static(b"chunk"))
            .await,
        Err(StorageError::Denied)
    );

    let err = client
        .put_block("photos", "big.bin", "b2", Bytes::from(vec![0u8; MAX_BLOCK_SIZE + 1]))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::TooLarge { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn oversized_upload_is_never_dispatched() {
    let server = MockServer::start().await;
    let data = Bytes::from(vec![0u8; MAX_BLOB_SIZE + 1]);
    let err = backend(&server)
        .put_blob("photos", "big", data, &PutBlobOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StorageError::TooLarge {
            size: MAX_BLOB_SIZE + 1,
            limit: MAX_BLOB_SIZE
        }
    );
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn get_blob_status_mapping() {
    let server = MockServer::start().await;
    for (name, status) in [("missing", 404), ("secret", 403), ("anon", 401), ("flaky", 503), ("dup", 409)] {
        Mock::given(method("GET"))
            .and(path(format!("/{DEV_ACCOUNT}/photos/{name}")))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path(format!("/{DEV_ACCOUNT}/photos/ok")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
        .mount(&server)
        .await;

    let client = backend(&server);
    assert_eq!(&client.get_blob("photos", "ok").await.unwrap()[..], b"payload");
    assert_eq!(client.get_blob("photos", "missing").await, Err(StorageError::NotFound));
    assert_eq!(client.get_blob("photos", "secret").await, Err(StorageError::Denied));
    assert_eq!(client.get_blob("photos", "anon").await, Err(StorageError::Denied));
    assert!(matches!(
        client.get_blob("photos", "flaky").await,
        Err(StorageError::Transient(_))
    ));
    // 409 means AlreadyExists only for container creation
    assert!(matches!(
        client.get_blob("photos", "dup").await,
        Err(StorageError::Transient(_))
    ));
}

#[tokio::test]
async fn delete_and_probe_blob() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("/{DEV_ACCOUNT}/photos/a")))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/{DEV_ACCOUNT}/photos/a")))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/{DEV_ACCOUNT}/photos/b")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = backend(&server);
    client.delete_blob("photos", "a").await.unwrap();
    assert_eq!(
        client.delete_blob("photos", "zzz").await,
        Err(StorageError::NotFound)
    );
    assert!(client.blob_exists("photos", "a").await.unwrap());
    assert!(!client.blob_exists("photos", "b").await.unwrap());
}

#[tokio::test]
async fn unreachable_service_is_transient() {
    let config = StorageConfig::new(DEV_ACCOUNT, DEV_KEY, Some("127.0.0.1:1".into()));
    let client = config.connect().unwrap();
    assert!(matches!(
        client.list_containers().await,
        Err(StorageError::Transient(_))
    ));
}
