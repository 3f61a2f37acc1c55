use std::path::{Path, PathBuf};

use bytes::BytesMut;
use futures::stream::TryStreamExt;
use thiserror::Error;
use tokio::{fs, io};

pub use reqwest::{Client, StatusCode};

use crate::registry::{Entry, Registry};
use crate::task::DownloadTask;

/// Size of the pieces written to disk between two progress updates.
pub const CHUNK_SIZE: usize = 64 * 1_024;

const PARTIAL_EXT: &str = "part";

/// A failed download, which is local to its task.
#[derive(Debug, Error)]
pub enum Error {
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("response does not declare a content length")]
    ContentLengthMissing,
    #[error("transfer failed: {0}")]
    Transfer(#[from] reqwest::Error),
    #[error("received {written} bytes instead of the {expected} declared")]
    Incomplete { expected: u64, written: u64 },
    #[error(transparent)]
    Filesystem(#[from] io::Error),
    #[error("`{0}` is already being downloaded")]
    DuplicateKey(String),
    #[error("download panicked: {0}")]
    Panicked(String),
}

/// Download manager streaming files to disk while reporting their progress.
#[derive(Debug, Clone)]
pub struct Manager {
    client: Client,
    chunk_size: usize,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            client: Client::default(),
            chunk_size: CHUNK_SIZE,
        }
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    /// Use `chunk_size` bytes pieces instead of [`CHUNK_SIZE`], zero being bumped to one.
    #[inline]
    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            ..self
        }
    }

    /// Download `task` to its destination, returning the number of bytes written.
    ///
    /// The task's key is tracked in `registry` from before the request is sent until the file is complete or the download failed.
    /// The body is streamed to a `.part` sibling first and only renamed to the destination once complete, so the destination
    /// never exists unless the download fully succeeded.
    pub async fn download(&self, task: &DownloadTask, registry: &Registry) -> Result<u64, Error> {
        let mut entry = registry.track(task.key()).ok_or_else(|| Error::DuplicateKey(task.key().to_owned()))?;

        let partial = partial_path(task.destination());

        let result = match self.transfer(task, &partial, &mut entry).await {
            Ok(written) => fs::rename(&partial, task.destination()).await.map(|()| written).map_err(Error::from),
            Err(err) => Err(err),
        };

        if result.is_err() {
            // nothing to clean when failing before the file is created
            if let Err(err) = fs::remove_file(&partial).await {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Cannot remove partial file `{}`: {err}", partial.display());
                }
            }
        }

        result
    }

    async fn transfer(&self, task: &DownloadTask, partial: &Path, entry: &mut Entry) -> Result<u64, Error> {
        use io::AsyncWriteExt;

        let resp = self.client.get(task.url().clone()).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Status(resp.status()));
        }

        let total = resp.content_length().ok_or(Error::ContentLengthMissing)?;

        tracing::debug!("Downloading {total} bytes from `{}` to `{}`", task.url(), partial.display());

        let mut file = fs::File::create(partial).await?;
        let mut stream = resp.bytes_stream();
        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        let mut written = 0;

        // network reads come in arbitrary sizes, pieces are written in fixed sizes
        while let Some(bytes) = stream.try_next().await? {
            buffer.extend_from_slice(&bytes);

            while buffer.len() >= self.chunk_size {
                let chunk = buffer.split_to(self.chunk_size);
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
                entry.update(written, total);
            }
        }

        if !buffer.is_empty() {
            file.write_all(&buffer).await?;
            written += buffer.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;

        if written != total {
            return Err(Error::Incomplete { expected: total, written });
        }

        entry.update(written, total);

        Ok(written)
    }
}

/// Return the path the body of a download to `destination` is streamed to.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut path = destination.as_os_str().to_owned();
    path.push(".");
    path.push(PARTIAL_EXT);
    path.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_path() {
        assert_eq!(partial_path(Path::new("out/a.mp3")), Path::new("out/a.mp3.part"));
        assert_eq!(partial_path(Path::new("out/a")), Path::new("out/a.part"));
    }

    #[test]
    fn test_chunk_size_is_never_zero() {
        let manager = Manager::new().with_chunk_size(0);
        assert_eq!(manager.chunk_size, 1);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_duplicate_key_fails_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let _active = registry.track("a.mp3").unwrap();

        let task = DownloadTask::new(
            "http://127.0.0.1:9/a.mp3".parse().unwrap(),
            dir.path().join("a.mp3"),
            "a.mp3".to_owned(),
        );

        let err = Manager::new().download(&task, &registry).await.unwrap_err();

        assert!(matches!(err, Error::DuplicateKey(ref key) if key == "a.mp3"), "{err:?}");
        assert_eq!(registry.len(), 1);
        assert!(!dir.path().join("a.mp3.part").exists());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_connection_failure_releases_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();

        // nothing listens on the discard port
        let task = DownloadTask::new(
            "http://127.0.0.1:9/a.mp3".parse().unwrap(),
            dir.path().join("a.mp3"),
            "a.mp3".to_owned(),
        );

        let manager = Manager::new().with_client(Client::builder().no_proxy().build().unwrap());
        let err = manager.download(&task, &registry).await.unwrap_err();

        assert!(matches!(err, Error::Transfer(_)), "{err:?}");
        assert!(registry.is_empty());
        assert!(!task.destination().exists());
    }
}
