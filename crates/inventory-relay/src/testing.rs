use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use aws_credential_types::Credentials;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderMap;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use url::Url;

use crate::config::Config;
use crate::listener::parse_records;
use crate::sink::{Sink, SinkError, Transport};

pub fn transient_error() -> SinkError {
    SinkError::Rejected {
        status: StatusCode::BAD_REQUEST,
        kind: "ProvisionedThroughputExceededException".into(),
        message: "Rate exceeded for shard".into(),
    }
}

/// Accepts every payload and keeps a copy.
#[derive(Default)]
pub struct RecordingSink {
    pub payloads: Mutex<Vec<Bytes>>,
}

impl RecordingSink {
    /// Decoded lines of every payload received, in order.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .map(|p| parse_records(std::str::from_utf8(p).unwrap()))
            .collect()
    }
}

impl Sink for RecordingSink {
    async fn write(&self, payload: Bytes) -> Result<usize, SinkError> {
        let len = payload.len();
        self.payloads.lock().unwrap().push(payload);
        Ok(len)
    }
}

pub struct FailingSink;

impl Sink for FailingSink {
    async fn write(&self, _payload: Bytes) -> Result<usize, SinkError> {
        Err(SinkError::Exhausted {
            attempts: 3,
            last: Box::new(transient_error()),
        })
    }
}

/// Records payloads like [`RecordingSink`], but only after a delay.
#[derive(Default)]
pub struct SlowSink {
    pub inner: RecordingSink,
}

impl Sink for SlowSink {
    async fn write(&self, payload: Bytes) -> Result<usize, SinkError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.inner.write(payload).await
    }
}

/// Fails the first `failures` attempts, then succeeds.
pub struct ScriptedTransport {
    pub failures: u32,
    pub attempts: AtomicU32,
    pub keys: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn failing_first(failures: u32) -> Self {
        Self {
            failures,
            attempts: AtomicU32::new(0),
            keys: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    async fn put_record(&self, _payload: Bytes, partition_key: String) -> Result<(), SinkError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(partition_key);
        if attempt < self.failures {
            Err(transient_error())
        } else {
            Ok(())
        }
    }
}

pub fn install_crypto() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Bind to port 0 and return the OS-assigned port.
/// The listener is dropped, freeing the port for the caller to rebind.
pub async fn free_port() -> u16 {
    tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub async fn dummy_config() -> Config {
    install_crypto();
    Config {
        stream_name: "inventory-metrics".into(),
        region: "us-east-1".into(),
        kinesis_endpoint: Url::parse("http://127.0.0.1:4567/").unwrap(),
        listener_port: free_port().await,
        buffer_capacity: 16,
        flush_interval: Duration::from_secs(30),
        max_attempts: 3,
        retry_base: Duration::from_millis(10),
        send_deadline: None,
        export_timeout: Duration::from_millis(500),
        ca_cert: None,
        credentials: Credentials::new("AKIDEXAMPLE", "secret", None, None, "test"),
        role_arn: None,
        role_session_name: "inventory-relay".into(),
        sts_endpoint: Url::parse("http://127.0.0.1:4568/").unwrap(),
    }
}

/// A request seen by [`fake_endpoint`].
pub struct Captured {
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub type Store = Arc<Mutex<Vec<Captured>>>;

/// Local HTTP endpoint answering every request with `status` and `reply`.
pub async fn fake_endpoint(status: StatusCode, reply: &'static str) -> (Url, Store) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
    let store: Store = Arc::new(Mutex::new(Vec::new()));
    let store_clone = Arc::clone(&store);

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let store = Arc::clone(&store_clone);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let store = Arc::clone(&store);
                    async move {
                        let headers = req.headers().clone();
                        let body = req.collect().await.unwrap().to_bytes();
                        store.lock().unwrap().push(Captured { headers, body });
                        let mut resp = Response::new(Full::new(Bytes::from_static(reply.as_bytes())));
                        *resp.status_mut() = status;
                        Ok::<_, Infallible>(resp)
                    }
                });
                let _ = Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (url, store)
}

pub fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .unwrap_or_else(|| panic!("missing header {name}"))
        .to_str()
        .unwrap()
}
