//! This module turns discovered episodes into download tasks.

use std::collections::HashSet;
use std::path::PathBuf;

use futures::stream::TryStreamExt;
use url::Url;

use crate::discovery::{self, Discover, Episode};
use crate::task::{DownloadTask, Queue};

/// Return the file extension of `url`, taken from its last path segment.
pub fn extension(url: &Url) -> Option<&str> {
    let segment = url.path_segments()?.next_back()?;

    match segment.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

/// Make `title` usable as a file name.
pub fn sanitize(title: &str) -> String {
    title.trim().replace(['/', '\\', '\0'], "_")
}

/// Return the display key of `episode`: its title followed by the extension of its source, if any.
///
/// The key doubles as the file name of the episode in the output directory.
pub fn display_key(episode: &Episode) -> String {
    let title = sanitize(&episode.title);

    match extension(&episode.url) {
        Some(ext) => format!("{title}.{ext}"),
        None => title,
    }
}

/// Whether `key` names a file inside the output directory rather than the directory itself or its parent.
pub fn is_usable(key: &str) -> bool {
    !key.chars().all(|c| c == '.')
}

/// Feeds the work queue from a discovery source.
///
/// Episodes whose file already exists in the output directory are skipped without any request, so that running the
/// whole program again after a partial run only downloads what is missing.
#[derive(Debug)]
pub struct Producer {
    output: PathBuf,
    queue: Queue<DownloadTask>,
    /// Keys enqueued during this run.
    keys: HashSet<String>,
    enqueued: usize,
    skipped: usize,
}

impl Producer {
    pub fn new(output: impl Into<PathBuf>, queue: Queue<DownloadTask>) -> Self {
        Self {
            output: output.into(),
            queue,
            keys: HashSet::new(),
            enqueued: 0,
            skipped: 0,
        }
    }

    /// Number of tasks pushed so far.
    #[inline]
    pub fn enqueued(&self) -> usize {
        self.enqueued
    }

    /// Number of episodes skipped so far.
    #[inline]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Enqueue a task for `episode` unless its file already exists, returning whether it has been enqueued.
    pub async fn feed(&mut self, episode: Episode) -> bool {
        let key = display_key(&episode);

        if !is_usable(&key) {
            tracing::warn!("Skipping `{}`: title {:?} gives no usable file name", episode.url, episode.title);
            self.skipped += 1;
            return false;
        }

        let destination = self.output.join(&key);

        if self.keys.contains(&key) {
            tracing::warn!("Skipping `{}`: another episode already downloads to `{key}`", episode.url);
            self.skipped += 1;
            return false;
        }

        match tokio::fs::try_exists(&destination).await {
            Ok(true) => {
                tracing::debug!("Skipping already downloaded `{}`", destination.display());
                self.skipped += 1;
                return false;
            }
            Ok(false) => {}
            // let the download itself report the problem
            Err(err) => tracing::warn!("Cannot check `{}`: {err}", destination.display()),
        }

        self.keys.insert(key.clone());
        self.queue.push(DownloadTask::new(episode.url, destination, key));
        self.enqueued += 1;

        true
    }

    /// Feed every episode of `discover`, stopping at the first discovery error.
    pub async fn produce<D: Discover + ?Sized>(&mut self, discover: &D) -> Result<(), discovery::Error> {
        let mut episodes = discover.episodes();

        while let Some(episode) = episodes.try_next().await? {
            self.feed(episode).await;
        }

        Ok(())
    }
}
