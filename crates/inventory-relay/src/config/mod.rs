use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use aws_credential_types::Credentials;
use thiserror::Error;
use url::Url;

const PREFIX: &str = "INVENTORY_RELAY_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("INVENTORY_RELAY_STREAM_NAME is required but not set")]
    StreamNameMissing,

    #[error("INVENTORY_RELAY_REGION (or AWS_REGION) is required but not set")]
    RegionMissing,

    #[error("AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY are required but not set")]
    CredentialsMissing,

    #[error("{0} is not a valid URL: {1}")]
    EndpointInvalidUrl(String, String),

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("{0} must be greater than zero")]
    Zero(String),
}

#[derive(Debug)]
pub struct Config {
    pub stream_name: String,
    pub region: String,
    pub kinesis_endpoint: Url,
    pub listener_port: u16,
    pub buffer_capacity: usize,
    pub flush_interval: Duration,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub send_deadline: Option<Duration>,
    pub export_timeout: Duration,
    pub ca_cert: Option<PathBuf>,
    pub credentials: Credentials,
    /// Role assumed through STS before signing stream requests.
    pub role_arn: Option<String>,
    pub role_session_name: String,
    pub sts_endpoint: Url,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with(PREFIX) || k.starts_with("AWS_"))
            .collect();
        Self::parse(&vars)
    }

    fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let stream_name = non_empty(vars, "INVENTORY_RELAY_STREAM_NAME")
            .ok_or(ConfigError::StreamNameMissing)?
            .to_owned();
        let region = non_empty(vars, "INVENTORY_RELAY_REGION")
            .or_else(|| non_empty(vars, "AWS_REGION"))
            .ok_or(ConfigError::RegionMissing)?
            .to_owned();
        let kinesis_endpoint = parse_endpoint(vars, "INVENTORY_RELAY_KINESIS_ENDPOINT", "kinesis", &region)?;
        let sts_endpoint = parse_endpoint(vars, "INVENTORY_RELAY_STS_ENDPOINT", "sts", &region)?;
        let listener_port = parse_number(vars, "INVENTORY_RELAY_LISTENER_PORT", 4320)?;
        let buffer_capacity = parse_positive(vars, "INVENTORY_RELAY_BUFFER_CAPACITY", 16_384)?;
        let flush_interval = parse_duration_ms(vars, "INVENTORY_RELAY_FLUSH_INTERVAL_MS", 30_000)?;
        let max_attempts = parse_positive(vars, "INVENTORY_RELAY_MAX_ATTEMPTS", 3)?;
        let retry_base = parse_duration_ms(vars, "INVENTORY_RELAY_RETRY_BASE_MS", 1000)?;
        let send_deadline = parse_optional_duration_ms(vars, "INVENTORY_RELAY_SEND_DEADLINE_MS")?;
        let export_timeout = parse_duration_ms(vars, "INVENTORY_RELAY_EXPORT_TIMEOUT_MS", 5000)?;
        let ca_cert = non_empty(vars, "INVENTORY_RELAY_CA_CERT").map(PathBuf::from);
        let credentials = parse_credentials(vars)?;
        let role_arn = non_empty(vars, "INVENTORY_RELAY_ROLE_ARN").map(str::to_owned);
        let role_session_name = non_empty(vars, "INVENTORY_RELAY_ROLE_SESSION_NAME")
            .unwrap_or("inventory-relay")
            .to_owned();

        if flush_interval.is_zero() {
            return Err(ConfigError::Zero("INVENTORY_RELAY_FLUSH_INTERVAL_MS".to_owned()));
        }

        Ok(Self {
            stream_name,
            region,
            kinesis_endpoint,
            listener_port,
            buffer_capacity,
            flush_interval,
            max_attempts,
            retry_base,
            send_deadline,
            export_timeout,
            ca_cert,
            credentials,
            role_arn,
            role_session_name,
            sts_endpoint,
        })
    }
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    vars.get(name).map(|s| s.as_str()).filter(|s| !s.is_empty())
}

/// Explicit override, else the regional endpoint of `service`.
fn parse_endpoint(
    vars: &HashMap<String, String>,
    name: &str,
    service: &str,
    region: &str,
) -> Result<Url, ConfigError> {
    let raw = non_empty(vars, name)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("https://{service}.{region}.amazonaws.com/"));

    Url::parse(&raw).map_err(|_| ConfigError::EndpointInvalidUrl(name.to_owned(), raw))
}

fn parse_number<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(default),
    }
}

fn parse_positive<T: std::str::FromStr + Default + PartialEq>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    let value = parse_number(vars, name, default)?;
    if value == T::default() {
        return Err(ConfigError::Zero(name.to_owned()));
    }
    Ok(value)
}

fn parse_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    parse_number(vars, name, default_ms).map(Duration::from_millis)
}

/// Unset or `0` disables the limit.
fn parse_optional_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
) -> Result<Option<Duration>, ConfigError> {
    match parse_number(vars, name, 0u64)? {
        0 => Ok(None),
        ms => Ok(Some(Duration::from_millis(ms))),
    }
}

fn parse_credentials(vars: &HashMap<String, String>) -> Result<Credentials, ConfigError> {
    let access_key = non_empty(vars, "AWS_ACCESS_KEY_ID").ok_or(ConfigError::CredentialsMissing)?;
    let secret_key =
        non_empty(vars, "AWS_SECRET_ACCESS_KEY").ok_or(ConfigError::CredentialsMissing)?;
    let session_token = non_empty(vars, "AWS_SESSION_TOKEN").map(str::to_owned);

    Ok(Credentials::new(
        access_key,
        secret_key,
        session_token,
        None,
        "environment",
    ))
}
