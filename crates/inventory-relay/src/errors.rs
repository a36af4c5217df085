use thiserror::Error;

use crate::config::ConfigError;
use crate::kinesis::TlsError;

/// Startup failures. Each one ends the process with a non-zero exit.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsError),

    #[error("failed to bind records listener: {0}")]
    ListenerBind(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ExitError {
    #[error("runtime failure: {0}")]
    RuntimeFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_error_wraps_config_error() {
        let err = InitError::from(ConfigError::StreamNameMissing);
        assert!(matches!(err, InitError::Config(_)));
        assert_eq!(
            err.to_string(),
            "configuration error: INVENTORY_RELAY_STREAM_NAME is required but not set"
        );
    }

    #[test]
    fn init_error_wraps_bind_failure() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = InitError::from(io);
        assert!(matches!(err, InitError::ListenerBind(_)));
    }
}
