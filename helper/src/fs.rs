//! Temp-file handling.
//!
//! Downloads that assemble multi-MB artifacts stream them into a uniquely
//! named file first and only hand the path over once the content is
//! complete. [`TempFile`] owns that lifecycle: the file is unlinked on drop
//! unless [`TempFile::persist`] was called.

use std::{
    io,
    path::{Path, PathBuf},
};

use tempfile::TempPath;
use tokio::{fs::File, io::AsyncWriteExt};

/// An open, uniquely named file inside a chosen directory.
pub struct TempFile {
    file: File,
    path: TempPath,
}

impl TempFile {
    /// Opens a fresh uniquely named file in `dir`.
    pub async fn create_in(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_owned();

        let named = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix("download_").tempfile_in(dir)
        })
        .await
        .map_err(io::Error::other)??;

        let (file, path) = named.into_parts();
        Ok(Self {
            file: File::from_std(file),
            path,
        })
    }

    /// The file's path. Valid until the value is dropped or persisted.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `data` at the current position.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await
    }

    /// Flushes and keeps the file on disk, returning its path.
    pub async fn persist(mut self) -> io::Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        self.path.keep().map_err(|e| e.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persist_keeps_the_file() {
        let dir = tempfile::tempdir().unwrap();

        let mut file = TempFile::create_in(dir.path()).await.unwrap();
        file.write_all(b"slice").await.unwrap();
        let path = file.persist().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"slice");
    }

    #[tokio::test]
    async fn drop_unlinks_the_file() {
        let dir = tempfile::tempdir().unwrap();

        let file = TempFile::create_in(dir.path()).await.unwrap();
        let path = file.path().to_owned();
        assert!(path.exists());

        drop(file);
        assert!(!path.exists());
    }
}
