use std::time::Duration;

use bytes::Bytes;
use hyper::StatusCode;
use tokio::net::TcpListener;

use super::*;
use crate::testing::{dummy_config, fake_endpoint, header};

#[derive(DeJson)]
struct ReceivedPutRecord {
    #[nserde(rename = "StreamName")]
    stream_name: String,
    #[nserde(rename = "PartitionKey")]
    partition_key: String,
    #[nserde(rename = "Data")]
    data: String,
}

async fn transport_for(endpoint: Url) -> KinesisTransport {
    let mut config = dummy_config().await;
    config.kinesis_endpoint = endpoint;
    KinesisTransport::new(&config).unwrap()
}

#[tokio::test]
async fn put_record_sends_signed_json() {
    let (url, store) = fake_endpoint(StatusCode::OK, r#"{"SequenceNumber":"1","ShardId":"shardId-000000000000"}"#).await;
    let transport = transport_for(url).await;

    transport
        .put_record(Bytes::from("ns.a 1 100\n"), "abc123".into())
        .await
        .unwrap();

    let captured = store.lock().unwrap();
    assert_eq!(captured.len(), 1);
    let req = &captured[0];

    assert_eq!(header(&req.headers, "x-amz-target"), "Kinesis_20131202.PutRecord");
    assert_eq!(header(&req.headers, "content-type"), "application/x-amz-json-1.1");
    assert!(req.headers.contains_key("x-amz-date"));
    let auth = header(&req.headers, "authorization");
    assert!(
        auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"),
        "unexpected authorization: {auth}"
    );
    assert!(auth.contains("/us-east-1/kinesis/aws4_request"));
    assert!(auth.contains("x-amz-target"), "target header must be signed");

    let body: ReceivedPutRecord =
        DeJson::deserialize_json(std::str::from_utf8(&req.body).unwrap()).unwrap();
    assert_eq!(body.stream_name, "inventory-metrics");
    assert_eq!(body.partition_key, "abc123");
    assert_eq!(BASE64.decode(body.data).unwrap(), b"ns.a 1 100\n");
}

#[tokio::test]
async fn throttling_response_is_rejected_with_exception_name() {
    let (url, _store) = fake_endpoint(
        StatusCode::BAD_REQUEST,
        r#"{"__type":"ProvisionedThroughputExceededException","message":"Rate exceeded for shard"}"#,
    )
    .await;
    let transport = transport_for(url).await;

    let err = transport
        .put_record(Bytes::from("x\n"), "k".into())
        .await
        .unwrap_err();

    match err {
        SinkError::Rejected {
            status,
            kind,
            message,
        } => {
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(kind, "ProvisionedThroughputExceededException");
            assert_eq!(message, "Rate exceeded for shard");
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn unresponsive_endpoint_times_out() {
    // Accepts connections but never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            held.push(stream);
        }
    });

    let mut config = dummy_config().await;
    config.kinesis_endpoint = url;
    config.export_timeout = Duration::from_millis(100);
    let transport = KinesisTransport::new(&config).unwrap();

    let err = transport
        .put_record(Bytes::from("x\n"), "k".into())
        .await
        .unwrap_err();
    assert!(matches!(err, SinkError::Timeout(d) if d == Duration::from_millis(100)));
}

#[test]
fn rejection_strips_namespaced_type() {
    let err = rejection(
        StatusCode::BAD_REQUEST,
        br#"{"__type":"com.amazonaws.kinesis#ResourceNotFoundException","message":"Stream not found"}"#,
    );
    assert!(matches!(
        err,
        SinkError::Rejected { kind, message, .. }
            if kind == "ResourceNotFoundException" && message == "Stream not found"
    ));
}

#[test]
fn rejection_keeps_raw_body_when_not_json() {
    let err = rejection(StatusCode::BAD_GATEWAY, b"upstream unavailable");
    assert!(matches!(
        err,
        SinkError::Rejected { status, kind, message }
            if status == StatusCode::BAD_GATEWAY && kind == "Unknown" && message == "upstream unavailable"
    ));
}

#[test]
fn host_header_includes_explicit_port() {
    let url = Url::parse("http://localhost:4567/").unwrap();
    assert_eq!(host_header(&url), "localhost:4567");
    let url = Url::parse("https://kinesis.us-east-1.amazonaws.com/").unwrap();
    assert_eq!(host_header(&url), "kinesis.us-east-1.amazonaws.com");
}

#[test]
fn missing_ca_cert_is_reported() {
    crate::testing::install_crypto();
    let err = tls_config(Some(Path::new("/nonexistent/ca.pem"))).unwrap_err();
    assert!(matches!(err, TlsError::ReadCaCert { .. }));
}

#[test]
fn ca_file_without_certificates_is_rejected() {
    crate::testing::install_crypto();
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), "not a certificate\n").unwrap();

    let err = tls_config(Some(file.path())).unwrap_err();
    assert!(matches!(err, TlsError::NoCertificates(p) if p == file.path()));
}

#[test]
fn default_roots_build() {
    crate::testing::install_crypto();
    assert!(tls_config(None).is_ok());
}
