#![allow(clippy::question_mark)] // nanoserde DeJson derive

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningParams, SigningSettings, sign};
use aws_sigv4::sign::v4;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use nanoserde::{DeJson, SerJson};
use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::sink::{SinkError, Transport};
use crate::sts::{AssumeRole, CredentialSource};

const SERVICE: &str = "kinesis";
const PUT_RECORD_TARGET: &str = "Kinesis_20131202.PutRecord";
const AMZ_JSON: &str = "application/x-amz-json-1.1";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read CA certificate {path}: {source}")]
    ReadCaCert {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("invalid CA certificate: {0}")]
    Rustls(#[from] rustls::Error),
}

#[derive(SerJson)]
struct PutRecordRequest {
    #[nserde(rename = "StreamName")]
    stream_name: String,
    #[nserde(rename = "PartitionKey")]
    partition_key: String,
    #[nserde(rename = "Data")]
    data: String,
}

#[derive(DeJson)]
struct ErrorResponse {
    #[nserde(rename = "__type")]
    kind: Option<String>,
    message: Option<String>,
}

pub(crate) type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Kinesis `PutRecord` over the JSON 1.1 protocol, SigV4 signed.
pub struct KinesisTransport {
    client: HttpsClient,
    endpoint: Url,
    stream_name: String,
    region: String,
    credentials: CredentialSource,
    timeout: Duration,
}

impl KinesisTransport {
    pub fn new(config: &Config) -> Result<Self, TlsError> {
        let client = https_client(config.ca_cert.as_deref())?;

        let credentials = match &config.role_arn {
            Some(role_arn) => CredentialSource::AssumeRole(AssumeRole::new(
                client.clone(),
                config,
                role_arn.clone(),
            )),
            None => CredentialSource::Static(config.credentials.clone()),
        };

        Ok(Self {
            client,
            endpoint: config.kinesis_endpoint.clone(),
            stream_name: config.stream_name.clone(),
            region: config.region.clone(),
            credentials,
            timeout: config.export_timeout,
        })
    }

    fn signed_request(
        &self,
        body: Bytes,
        credentials: &Credentials,
    ) -> Result<Request<Full<Bytes>>, SinkError> {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.as_str())
            .header(HOST, host_header(&self.endpoint))
            .header(CONTENT_TYPE, AMZ_JSON)
            .header("x-amz-target", PUT_RECORD_TARGET)
            .body(Full::new(body.clone()))?;

        sign_request(&mut request, &body, credentials, &self.region, SERVICE)?;
        Ok(request)
    }
}

/// HTTP(S) client trusting webpki roots plus the optional PEM bundle.
pub(crate) fn https_client(ca_cert: Option<&Path>) -> Result<HttpsClient, TlsError> {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config(ca_cert)?)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(https))
}

/// SigV4-sign `request` in place. `body` must be the exact bytes it carries.
pub(crate) fn sign_request(
    request: &mut Request<Full<Bytes>>,
    body: &[u8],
    credentials: &Credentials,
    region: &str,
    service: &str,
) -> Result<(), SinkError> {
    let identity = credentials.clone().into();
    let params: SigningParams<'_> = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name(service)
        .time(SystemTime::now())
        .settings(SigningSettings::default())
        .build()
        .map_err(|e| SinkError::Signing(e.to_string()))?
        .into();

    let uri = request.uri().to_string();
    let signable = SignableRequest::new(
        request.method().as_str(),
        &uri,
        request
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_str().unwrap_or_default())),
        SignableBody::Bytes(body),
    )
    .map_err(|e| SinkError::Signing(e.to_string()))?;

    let (instructions, _signature) = sign(signable, &params)
        .map_err(|e| SinkError::Signing(e.to_string()))?
        .into_parts();
    instructions.apply_to_request_http1x(request);

    Ok(())
}

impl Transport for KinesisTransport {
    async fn put_record(&self, payload: Bytes, partition_key: String) -> Result<(), SinkError> {
        let body = PutRecordRequest {
            stream_name: self.stream_name.clone(),
            partition_key,
            data: BASE64.encode(&payload),
        }
        .serialize_json();
        let credentials = self.credentials.resolve().await?;
        let request = self.signed_request(Bytes::from(body), &credentials)?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| SinkError::Timeout(self.timeout))??;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.into_body().collect().await?.to_bytes();
        Err(rejection(status, &body))
    }
}

pub(crate) fn host_header(endpoint: &Url) -> String {
    let host = endpoint.host_str().unwrap_or_default();
    match endpoint.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}

/// Map a non-2xx response to an error, keeping the service's exception name
/// when the body carries one.
fn rejection(status: StatusCode, body: &[u8]) -> SinkError {
    let text = String::from_utf8_lossy(body);
    let parsed: Option<ErrorResponse> = DeJson::deserialize_json(&text).ok();
    let (kind, message) = match parsed {
        Some(err) => (err.kind, err.message),
        None => (None, None),
    };

    SinkError::Rejected {
        status,
        kind: kind
            .map(|k| k.rsplit('#').next().unwrap_or_default().to_owned())
            .unwrap_or_else(|| "Unknown".to_owned()),
        message: message.unwrap_or_else(|| text.into_owned()),
    }
}

fn tls_config(ca_cert: Option<&Path>) -> Result<rustls::ClientConfig, TlsError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_cert {
        let read_err = |source| TlsError::ReadCaCert {
            path: path.to_owned(),
            source,
        };
        let file = File::open(path).map_err(read_err)?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_err)?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificates(path.to_owned()));
        }
        for cert in certs {
            roots.add(cert)?;
        }
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests;
