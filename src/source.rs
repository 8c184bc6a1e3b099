//! The upstream capability the cache loads from on a miss.
//!
//! The extraction pipeline implements [`Source`]; the cache never knows how
//! bytes are produced. Different upstream behaviors are separate
//! implementations of the one method.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;

/// Failure reported by a source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    /// 5xx-equivalent: the upstream is struggling.
    #[error("upstream unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    /// 4xx-equivalent: the request itself is wrong.
    #[error("upstream rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact: {0}")]
    Invalid(String),
}

/// Whether retrying can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl UpstreamError {
    pub fn class(&self) -> ErrorClass {
        match self {
            UpstreamError::Timeout(_) | UpstreamError::Connection(_) | UpstreamError::Unavailable { .. } => {
                ErrorClass::Transient
            }
            UpstreamError::Rejected { .. } | UpstreamError::NotFound(_) | UpstreamError::Invalid(_) => {
                ErrorClass::Permanent
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Produces artifact bytes for a key.
///
/// Implementations must give up by `deadline`; the fetcher enforces it as
/// well, so a source that overruns just has its result discarded.
#[async_trait]
pub trait Source: Send + Sync {
    /// Identity used to key per-source breaker and rate limiter state.
    fn id(&self) -> &str;

    async fn fetch(&self, key: &str, deadline: Instant) -> Result<Bytes, UpstreamError>;
}

/// Serves artifacts from files under a root directory.
///
/// Keys map to relative paths; anything that would escape the root is
/// rejected as invalid.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    id: String,
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, UpstreamError> {
        let rel = Path::new(key);
        let safe = !key.is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(UpstreamError::Invalid(format!("key {key:?} is not a relative artifact path")));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl Source for DirectorySource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, key: &str, deadline: Instant) -> Result<Bytes, UpstreamError> {
        let path = self.resolve(key)?;
        let budget = deadline.saturating_duration_since(Instant::now());
        let read = tokio::time::timeout_at(deadline, tokio::fs::read(&path)).await;
        match read {
            Err(_) => Err(UpstreamError::Timeout(budget)),
            Ok(Ok(data)) => Ok(Bytes::from(data)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(UpstreamError::NotFound(key.to_string())),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(UpstreamError::Rejected {
                status: 403,
                message: e.to_string(),
            }),
            Ok(Err(e)) => Err(UpstreamError::Connection(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_error_classification() {
        assert!(UpstreamError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(UpstreamError::Connection("reset".into()).is_transient());
        assert!(UpstreamError::Unavailable { status: 503, message: String::new() }.is_transient());
        assert_eq!(UpstreamError::Rejected { status: 400, message: String::new() }.class(), ErrorClass::Permanent);
        assert_eq!(UpstreamError::NotFound("k".into()).class(), ErrorClass::Permanent);
        assert_eq!(UpstreamError::Invalid("k".into()).class(), ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn test_directory_source_reads_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("pages")).unwrap();
        std::fs::write(tmp.path().join("pages/a.json"), b"{}").unwrap();

        let source = DirectorySource::new("dir", tmp.path());
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(&source.fetch("pages/a.json", deadline).await.unwrap()[..], b"{}");
        assert_eq!(
            source.fetch("pages/missing", deadline).await.unwrap_err(),
            UpstreamError::NotFound("pages/missing".into())
        );
    }

    #[tokio::test]
    async fn test_directory_source_rejects_escapes() {
        let source = DirectorySource::new("dir", "/srv/artifacts");
        let deadline = Instant::now() + Duration::from_secs(5);
        for key in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(matches!(source.fetch(key, deadline).await, Err(UpstreamError::Invalid(_))), "{key}");
        }
    }
}
