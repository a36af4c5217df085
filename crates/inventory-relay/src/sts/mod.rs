#![allow(clippy::question_mark)] // nanoserde DeJson derive

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_credential_types::Credentials;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use nanoserde::DeJson;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;
use url::form_urlencoded;

use crate::config::Config;
use crate::kinesis::{HttpsClient, host_header, sign_request};
use crate::sink::SinkError;

const SERVICE: &str = "sts";
const API_VERSION: &str = "2011-06-15";
const FORM: &str = "application/x-www-form-urlencoded";

/// Assumed credentials are refreshed this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Where request-signing credentials come from.
pub enum CredentialSource {
    Static(Credentials),
    AssumeRole(AssumeRole),
}

impl CredentialSource {
    pub async fn resolve(&self) -> Result<Credentials, SinkError> {
        match self {
            Self::Static(credentials) => Ok(credentials.clone()),
            Self::AssumeRole(role) => role.credentials().await,
        }
    }
}

// STS answers in JSON when asked with `Accept: application/json`.
#[derive(DeJson)]
struct AssumeRoleEnvelope {
    #[nserde(rename = "AssumeRoleResponse")]
    response: AssumeRoleResponse,
}

#[derive(DeJson)]
struct AssumeRoleResponse {
    #[nserde(rename = "AssumeRoleResult")]
    result: AssumeRoleResult,
}

#[derive(DeJson)]
struct AssumeRoleResult {
    #[nserde(rename = "Credentials")]
    credentials: RoleCredentials,
}

#[derive(DeJson)]
struct RoleCredentials {
    #[nserde(rename = "AccessKeyId")]
    access_key_id: String,
    #[nserde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[nserde(rename = "SessionToken")]
    session_token: String,
    /// Seconds since the Unix epoch.
    #[nserde(rename = "Expiration")]
    expiration: f64,
}

/// Temporary credentials for `role_arn`, obtained with the base credentials
/// and cached until they near expiry.
pub struct AssumeRole {
    client: HttpsClient,
    endpoint: Url,
    region: String,
    role_arn: String,
    session_name: String,
    base: Credentials,
    timeout: Duration,
    cached: Mutex<Option<Credentials>>,
}

impl AssumeRole {
    pub(crate) fn new(client: HttpsClient, config: &Config, role_arn: String) -> Self {
        Self {
            client,
            endpoint: config.sts_endpoint.clone(),
            region: config.region.clone(),
            role_arn,
            session_name: config.role_session_name.clone(),
            base: config.credentials.clone(),
            timeout: config.export_timeout,
            cached: Mutex::new(None),
        }
    }

    /// Cached credentials, or fresh ones if none are cached or they are about
    /// to expire. Concurrent callers wait on the same refresh.
    pub async fn credentials(&self) -> Result<Credentials, SinkError> {
        let mut cached = self.cached.lock().await;
        if let Some(credentials) = cached.as_ref()
            && !expiring(credentials, SystemTime::now())
        {
            return Ok(credentials.clone());
        }

        let fresh = self.assume().await?;
        debug!(role_arn = %self.role_arn, "assumed role");
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    async fn assume(&self) -> Result<Credentials, SinkError> {
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("Action", "AssumeRole")
            .append_pair("Version", API_VERSION)
            .append_pair("RoleArn", &self.role_arn)
            .append_pair("RoleSessionName", &self.session_name)
            .finish();
        let body = Bytes::from(body);

        let mut request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.as_str())
            .header(HOST, host_header(&self.endpoint))
            .header(CONTENT_TYPE, FORM)
            .header(ACCEPT, "application/json")
            .body(Full::new(body.clone()))?;
        sign_request(&mut request, &body, &self.base, &self.region, SERVICE)?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| SinkError::Timeout(self.timeout))??;

        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        let text = String::from_utf8_lossy(&body);
        if !status.is_success() {
            return Err(SinkError::AssumeRole(format!("HTTP {status}: {text}")));
        }

        let envelope: AssumeRoleEnvelope = DeJson::deserialize_json(&text)
            .map_err(|e| SinkError::AssumeRole(format!("unexpected response: {e}")))?;
        Ok(into_credentials(envelope.response.result.credentials))
    }
}

fn into_credentials(role: RoleCredentials) -> Credentials {
    let expiry = UNIX_EPOCH + Duration::try_from_secs_f64(role.expiration).unwrap_or_default();
    Credentials::new(
        role.access_key_id,
        role.secret_access_key,
        Some(role.session_token),
        Some(expiry),
        "sts-assume-role",
    )
}

fn expiring(credentials: &Credentials, now: SystemTime) -> bool {
    match credentials.expiry() {
        Some(expiry) => now + REFRESH_MARGIN >= expiry,
        None => false,
    }
}
