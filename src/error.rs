//! Error types shared by the extension and the registrator

use thiserror::Error;

/// Main error type for lambda-mesh operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Upstream descriptor failed to parse
    #[error("invalid upstream: {0}")]
    InvalidUpstream(String),

    /// Invocation mode tag is not SYNCHRONOUS or ASYNCHRONOUS
    #[error("invalid invocation mode: {0}")]
    InvalidInvocationMode(String),

    /// Cloud event did not carry a function ARN
    #[error("arn isn't populated")]
    ArnUndefined,

    /// Cloud event kind the registrator does not handle
    #[error("unsupported event kind {0}")]
    UnsupportedEvent(String),

    /// Partition/namespace tags require an enterprise mesh
    #[error("namespaces and admin partitions require an enterprise mesh")]
    NotEnterprise,

    /// Proxy listeners did not come up within the configured timeout
    #[error("timeout waiting for proxy to start")]
    ProxyStartTimeout,

    /// Parameter store failure
    #[error("parameter store error: {0}")]
    Store(String),

    /// Mesh catalog or config-entry failure
    #[error("mesh error: {0}")]
    Mesh(String),

    /// Function inventory failure
    #[error("function inventory error: {0}")]
    Functions(String),

    /// Certificate or private key material failed to parse
    #[error("TLS material error: {0}")]
    TlsMaterial(String),

    /// Runtime extensions API failure
    #[error("runtime API error: {0}")]
    RuntimeApi(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Proxy lifecycle error
    #[error(transparent)]
    Proxy(#[from] crate::proxy::ProxyError),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Several per-item failures collected from a fan-out operation
    #[error("{} errors occurred: {}", .0.len(), format_aggregate(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    /// Create a parameter store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a mesh error with the given message
    pub fn mesh(msg: impl Into<String>) -> Self {
        Self::Mesh(msg.into())
    }

    /// Create a function inventory error with the given message
    pub fn functions(msg: impl Into<String>) -> Self {
        Self::Functions(msg.into())
    }

    /// Create a TLS material error with the given message
    pub fn tls_material(msg: impl Into<String>) -> Self {
        Self::TlsMaterial(msg.into())
    }

    /// Create a runtime API error with the given message
    pub fn runtime_api(msg: impl Into<String>) -> Self {
        Self::RuntimeApi(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Collapse a list of per-item errors into a single error.
    ///
    /// Returns `Ok(())` for an empty list and the sole error unwrapped for a
    /// single-element list.
    pub fn aggregate(errors: Vec<Error>) -> Result<()> {
        let mut errors = errors;
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}

fn format_aggregate(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias using the lambda-mesh error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_nothing_is_ok() {
        assert!(Error::aggregate(Vec::new()).is_ok());
    }

    #[test]
    fn aggregate_of_one_unwraps() {
        let err = Error::aggregate(vec![Error::ArnUndefined]).unwrap_err();
        assert!(matches!(err, Error::ArnUndefined));
    }

    #[test]
    fn aggregate_of_many_lists_each_message() {
        let err = Error::aggregate(vec![
            Error::ArnUndefined,
            Error::UnsupportedEvent("PublishVersion".to_string()),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("2 errors occurred"));
        assert!(msg.contains("arn isn't populated"));
        assert!(msg.contains("PublishVersion"));
    }

    #[test]
    fn invocation_mode_error_names_the_mode() {
        let err = Error::InvalidInvocationMode("ASYNC".to_string());
        assert!(err.to_string().contains("ASYNC"));
    }
}
