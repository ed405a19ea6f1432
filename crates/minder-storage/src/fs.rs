//! Local-filesystem storage backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::{validate_rel_path, Result, Storage, StorageError};

/// Storage rooted at a local directory.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        validate_rel_path(path)?;
        Ok(self.root.join(path))
    }

    async fn ensure_parent(&self, full: &Path, rel: &str) -> Result<()> {
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(rel, e))?;
        }
        Ok(())
    }
}

fn io_err(path: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_string(),
        source,
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full)
            .await
            .map_err(|e| io_err(path, e))?)
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(io_err(path, e)),
        }
    }

    async fn put_text(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        self.ensure_parent(&full, path).await?;
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| io_err(path, e))
    }

    async fn append_text(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        self.ensure_parent(&full, path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .await
            .map_err(|e| io_err(path, e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| io_err(path, e))?;
        file.flush().await.map_err(|e| io_err(path, e))
    }

    async fn replace_text(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        self.ensure_parent(&full, path).await?;
        let tmp = full.with_extension("tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| io_err(path, e))?;
        tokio::fs::rename(&tmp, &full)
            .await
            .map_err(|e| io_err(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let full = self.resolve(path)?;
        let mut entries = match tokio::fs::read_dir(&full).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(path, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(path, e))? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        let meta = match tokio::fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(path, e)),
        };
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, FsStorage) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsStorage::new(dir.path());
        (dir, fs)
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (_dir, fs) = storage();
        fs.put_text("a/b/c.txt", "hello").await.unwrap();
        assert!(fs.exists("a/b/c.txt").await.unwrap());
        assert_eq!(fs.get_text("a/b/c.txt").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (_dir, fs) = storage();
        assert!(matches!(
            fs.get_text("nope.txt").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn append_accumulates_lines() {
        let (_dir, fs) = storage();
        fs.append_text("log.jsonl", "{\"a\":1}\n").await.unwrap();
        fs.append_text("log.jsonl", "{\"a\":2}\n").await.unwrap();
        let text = fs.get_text("log.jsonl").await.unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[tokio::test]
    async fn replace_is_total() {
        let (_dir, fs) = storage();
        fs.put_text("f.txt", "old content").await.unwrap();
        fs.replace_text("f.txt", "new").await.unwrap();
        assert_eq!(fs.get_text("f.txt").await.unwrap(), "new");
    }

    #[tokio::test]
    async fn list_missing_dir_is_empty() {
        let (_dir, fs) = storage();
        assert!(fs.list("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let (_dir, fs) = storage();
        fs.put_text("d/b.txt", "x").await.unwrap();
        fs.put_text("d/a.txt", "x").await.unwrap();
        assert_eq!(fs.list("d").await.unwrap(), vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn delete_dir_and_missing_is_noop() {
        let (_dir, fs) = storage();
        fs.put_text("d/x.txt", "x").await.unwrap();
        fs.delete("d").await.unwrap();
        assert!(!fs.exists("d").await.unwrap());
        fs.delete("d").await.unwrap();
    }
}
