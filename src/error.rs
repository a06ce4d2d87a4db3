use std::fmt;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum NodescopeError {
    #[error("unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    #[error("{message}: {source}")]
    CollectFailure {
        message: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to initialize {resource}: {reason}")]
    ResourceInit { resource: String, reason: String },

    #[error("no events were published for trace {0}")]
    EmptyTrace(String),

    #[error("Storage not configured.")]
    StorageNotConfigured,

    #[error("create container with storage error: status {status}, code {code}")]
    ContainerCreate { status: u16, code: String },

    #[error("append file {item} to blob: {source}")]
    Upload {
        item: String,
        #[source]
        source: Box<NodescopeError>,
    },

    #[error("storage request failed with status {status}: {code}")]
    StorageStatus { status: u16, code: String },

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodescopeError {
    /// Wrap an irrecoverable collection error with context
    pub fn collect<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        NodescopeError::CollectFailure {
            message: message.into(),
            source: source.into(),
        }
    }

    pub fn resource_init(resource: impl Into<String>, reason: impl fmt::Display) -> Self {
        NodescopeError::ResourceInit {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, NodescopeError::UnsupportedEnvironment(_))
    }

    pub fn is_resource_init(&self) -> bool {
        matches!(self, NodescopeError::ResourceInit { .. })
    }
}

pub type Result<T> = std::result::Result<T, NodescopeError>;

/// A single collector's failure within a pass
#[derive(Debug)]
pub struct CollectorFailure {
    pub collector: String,
    pub error: NodescopeError,
}

/// All collector failures of one orchestrated pass
#[derive(Debug)]
pub struct RunError {
    pub failures: Vec<CollectorFailure>,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} collector(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n\t{}: {}", failure.collector, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for RunError {}
