use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Outcome classification for a single outbound request.
///
/// Every variant is terminal for the attempt that produced it; nothing in the
/// pipeline retries a request inside the same run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("transport failure for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("HTTP {status} from {url}")]
    RemoteRejected { url: String, status: u16 },
    #[error("no proxy lease available for {url}")]
    ProxyUnavailable { url: String },
    #[error("undecodable response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn transport(url: &str, err: impl fmt::Display) -> Self {
        Self::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RemoteRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failure of the checkpoint table, error table, profile table or a JSON document.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document write failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("document encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Coarse tag stored with run statistics and prefixed to every error-log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    TransportFailure,
    RemoteRejected,
    SchemaMismatch,
    StorageFailure,
    ProxyUnavailable,
    WorkerPanic,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportFailure => "TransportFailure",
            Self::RemoteRejected => "RemoteRejected",
            Self::SchemaMismatch => "SchemaMismatch",
            Self::StorageFailure => "StorageFailure",
            Self::ProxyUnavailable => "ProxyUnavailable",
            Self::WorkerPanic => "WorkerPanic",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can end the processing of one identifier.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl HarvestError {
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::SchemaMismatch(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(FetchError::Transport { .. }) => ErrorKind::TransportFailure,
            Self::Fetch(FetchError::RemoteRejected { .. }) => ErrorKind::RemoteRejected,
            Self::Fetch(FetchError::ProxyUnavailable { .. }) => ErrorKind::ProxyUnavailable,
            // A 200 whose body is not the JSON we expect is a schema problem, not a network one.
            Self::Fetch(FetchError::Decode { .. }) | Self::SchemaMismatch(_) => {
                ErrorKind::SchemaMismatch
            }
            Self::Storage(_) => ErrorKind::StorageFailure,
        }
    }

    /// Message written to the error log: `<Kind>: <detail>`.
    pub fn audit_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_failures_count_as_schema_mismatch() {
        let err = HarvestError::from(FetchError::Decode {
            url: "http://x/profile/1".into(),
            message: "expected value".into(),
        });
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }

    #[test]
    fn audit_message_carries_kind_and_status() {
        let err = HarvestError::from(FetchError::RemoteRejected {
            url: "http://x/profile/101".into(),
            status: 404,
        });
        let msg = err.audit_message();
        assert!(msg.starts_with("RemoteRejected: "));
        assert!(msg.contains("404"));
    }

    #[test]
    fn storage_errors_map_to_storage_failure() {
        let err = HarvestError::from(StorageError::io(
            "/tmp/1_typing.json",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        ));
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
        assert!(err.to_string().contains("1_typing.json"));
    }
}
