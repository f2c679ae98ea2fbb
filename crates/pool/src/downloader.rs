//! Model weight downloader.
//!
//! Downloads are serialized per URL: concurrent requests for the same file
//! queue behind one in-flight transfer and find the file present when their
//! turn comes. A URL that failed once is not retried for the rest of the
//! process lifetime — later misses fail fast instead of hammering a broken
//! source. A file that downloaded fine and later disappears may be fetched
//! again.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use lg_domain::{Error, Result};

pub struct Downloader {
    client: reqwest::Client,
    /// Per-URL serialization locks.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// URLs that failed this process lifetime.
    failed: Mutex<HashSet<String>>,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            locks: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
        }
    }

    /// Instance-spawn pre-hook: make sure the weight file exists, fetching
    /// it from `url` when absent.
    pub async fn ensure_file(
        &self,
        file: &Path,
        url: Option<&str>,
        signal: &CancellationToken,
    ) -> Result<()> {
        if file.exists() {
            return Ok(());
        }
        let Some(url) = url else {
            return Err(Error::ModelFileMissing(file.to_owned()));
        };

        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // A queued peer may have finished the transfer while we waited.
        if file.exists() {
            return Ok(());
        }
        if self.failed.lock().contains(url) {
            return Err(Error::Download(format!(
                "{url}: already attempted this run"
            )));
        }

        match self.download(file, url, signal).await {
            Ok(()) => Ok(()),
            // An abort is the caller's doing, not the source's; leave the
            // URL eligible for another attempt.
            Err(Error::Aborted) => Err(Error::Aborted),
            Err(e) => {
                self.failed.lock().insert(url.to_string());
                Err(e)
            }
        }
    }

    async fn download(&self, file: &Path, url: &str, signal: &CancellationToken) -> Result<()> {
        let parent = file
            .parent()
            .ok_or_else(|| Error::Download(format!("{}: no parent directory", file.display())))?;
        tokio::fs::create_dir_all(parent).await?;

        tracing::info!(url, path = %file.display(), "downloading model file");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Download(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Download(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }

        // Stream into a temp file in the target directory, then rename so
        // a half-written file never passes the existence check.
        let mut staging = tempfile::NamedTempFile::new_in(parent)?;
        let mut stream = response.bytes_stream();
        let mut bytes: u64 = 0;
        while let Some(chunk) = stream.next().await {
            if signal.is_cancelled() {
                return Err(Error::Aborted);
            }
            let chunk = chunk.map_err(|e| Error::Download(format!("{url}: {e}")))?;
            staging.as_file_mut().write_all(&chunk)?;
            bytes += chunk.len() as u64;
        }
        staging
            .persist(file)
            .map_err(|e| Error::Download(format!("{}: {e}", file.display())))?;
        tracing::info!(url, bytes, path = %file.display(), "model file downloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_file_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("m.gguf");
        std::fs::write(&file, b"weights").unwrap();

        let downloader = Downloader::new();
        let signal = CancellationToken::new();
        downloader.ensure_file(&file, None, &signal).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_without_url_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("m.gguf");

        let downloader = Downloader::new();
        let signal = CancellationToken::new();
        let err = downloader
            .ensure_file(&file, None, &signal)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelFileMissing(_)));
    }

    #[tokio::test]
    async fn failed_url_is_not_retried_within_process() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("m.gguf");
        // Nothing listens on port 9 (discard); connection fails fast.
        let url = "http://127.0.0.1:9/m.gguf";

        let downloader = Downloader::new();
        let signal = CancellationToken::new();

        let first = downloader
            .ensure_file(&file, Some(url), &signal)
            .await
            .unwrap_err();
        assert!(matches!(first, Error::Download(_)));

        let second = downloader
            .ensure_file(&file, Some(url), &signal)
            .await
            .unwrap_err();
        match second {
            Error::Download(msg) => assert!(msg.contains("already attempted")),
            other => panic!("expected Download, got {other:?}"),
        }
    }
}
