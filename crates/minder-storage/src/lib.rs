//! Storage port: a directory+path text abstraction.
//!
//! The session store, usage tracker, and skill loader speak this trait
//! instead of the filesystem so the backend can be swapped for blob storage.
//! Paths are always relative, `/`-separated, and validated against `..`
//! traversal before they touch the backend.

mod fs;

pub use fs::FsStorage;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage path: {0}")]
    InvalidPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Abstract text storage over a directory tree.
///
/// All paths are relative to the backend's root. Implementations create
/// intermediate directories on write.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;

    async fn get_text(&self, path: &str) -> Result<String>;

    async fn put_text(&self, path: &str, content: &str) -> Result<()>;

    /// Append to a file, creating it (and parents) if absent.
    async fn append_text(&self, path: &str, content: &str) -> Result<()>;

    /// Atomically replace a file's content (write temp + rename, or the
    /// backend's equivalent).
    async fn replace_text(&self, path: &str, content: &str) -> Result<()>;

    /// Immediate children of a directory, names only, sorted. An absent
    /// directory lists as empty.
    async fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Delete a file or directory tree. Deleting an absent path is a no-op.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Reject absolute paths and `..` traversal before the backend sees them.
pub(crate) fn validate_rel_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(StorageError::InvalidPath("empty path".into()));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    if path.split('/').any(|seg| seg == ".." || seg.is_empty()) {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        assert!(validate_rel_path("/etc/passwd").is_err());
        assert!(validate_rel_path("a/../b").is_err());
        assert!(validate_rel_path("a//b").is_err());
        assert!(validate_rel_path("").is_err());
        assert!(validate_rel_path("conversations/telegram/42/meta.json").is_ok());
    }
}
