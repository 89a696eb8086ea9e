use std::fmt;

/// Top-level error type for the mock server's dispatch plane.
///
/// Request-level failures never surface as this type — they resolve to a
/// canonical RPC status (see `protocol::NormalizedError`) before they leave
/// the dispatcher. This type is for failures that happen around requests:
/// loading schemas and rules, building a snapshot, starting the façade.
#[derive(Debug)]
pub enum MockError {
    /// A named symbol (service, method, message, file) could not be resolved.
    NotFound(String),

    /// A malformed argument was supplied to a loader or config reader.
    InvalidArgument(String),

    /// An I/O error (file read, directory walk, socket bind).
    Io(std::io::Error),

    /// A `.proto` compile or descriptor-pool build error.
    Proto(String),

    /// A rule or config document failed to parse.
    Parse(String),

    /// A gRPC status produced while building or tearing down a service.
    GrpcStatus(tonic::Status),

    /// Any other error, boxed to avoid a combinatorial variant explosion.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for MockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockError::NotFound(name) => write!(f, "not found: {name}"),
            MockError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            MockError::Io(err) => write!(f, "I/O error: {err}"),
            MockError::Proto(msg) => write!(f, "proto error: {msg}"),
            MockError::Parse(msg) => write!(f, "parse error: {msg}"),
            MockError::GrpcStatus(status) => {
                write!(f, "gRPC error: {} - {}", status.code(), status.message())
            }
            MockError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for MockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MockError::Io(err) => Some(err),
            MockError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MockError {
    fn from(err: std::io::Error) -> Self {
        MockError::Io(err)
    }
}

impl From<tonic::Status> for MockError {
    fn from(status: tonic::Status) -> Self {
        MockError::GrpcStatus(status)
    }
}

impl From<serde_yaml::Error> for MockError {
    fn from(err: serde_yaml::Error) -> Self {
        MockError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for MockError {
    fn from(err: serde_json::Error) -> Self {
        MockError::Parse(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = MockError::NotFound("pkg.Service".into());
        assert_eq!(err.to_string(), "not found: pkg.Service");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: MockError = io_err.into();
        assert!(matches!(err, MockError::Io(_)));
    }

    #[test]
    fn yaml_error_becomes_parse_error() {
        let parsed: std::result::Result<serde_yaml::Value, _> = serde_yaml::from_str("a: [1, 2");
        let err: MockError = parsed.unwrap_err().into();
        assert!(matches!(err, MockError::Parse(_)));
    }
}
