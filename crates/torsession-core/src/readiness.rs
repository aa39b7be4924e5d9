//! Readiness detection: waiting for the daemon's authentication cookie.

use std::path::{Path, PathBuf};

use notify::{recommended_watcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Wait until `filename` inside `dir` exists with non-empty contents and
/// return its bytes.
///
/// The watcher registers for directory change events before the first
/// probe, so a file written earlier is still observed. Read failures while
/// waiting are expected (the daemon has not produced the cookie yet) and
/// keep the watch alive; only a failure to watch the directory at all is
/// fatal.
pub(crate) async fn wait_for_file(dir: &Path, filename: &str) -> Result<Vec<u8>> {
    let target: PathBuf = dir.join(filename);
    let (tx, mut rx) = mpsc::channel::<()>(16);

    let mut watcher = recommended_watcher(move |event: notify::Result<notify::Event>| {
        if event.is_ok() {
            let _ = tx.try_send(());
        }
    })
    .map_err(|e| Error::Filesystem(format!("watcher init failed: {e}")))?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Filesystem(format!("cannot watch {}: {e}", dir.display())))?;

    loop {
        match tokio::fs::read(&target).await {
            Ok(bytes) if !bytes.is_empty() => {
                debug!(path = %target.display(), len = bytes.len(), "readiness file present");
                return Ok(bytes);
            }
            Ok(_) => trace!(path = %target.display(), "readiness file still empty"),
            Err(e) => {
                trace!(path = %target.display(), error = %e, "readiness file not readable yet");
            }
        }
        if rx.recv().await.is_none() {
            return Err(Error::Filesystem("readiness watcher stopped".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_detects_file_written_after_watch_begins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().to_path_buf();
        let writer = tokio::spawn({
            let path = path.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                tokio::fs::write(path.join("cookie"), b"secret").await.expect("write cookie");
            }
        });

        let bytes = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_file(&path, "cookie"),
        )
        .await
        .expect("watch timed out")
        .expect("watch failed");
        assert_eq!(bytes, b"secret");
        writer.await.expect("writer task");
    }

    #[tokio::test]
    async fn test_detects_preexisting_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cookie"), b"already-there").expect("write cookie");

        let bytes = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_file(dir.path(), "cookie"),
        )
        .await
        .expect("watch timed out")
        .expect("watch failed");
        assert_eq!(bytes, b"already-there");
    }

    #[tokio::test]
    async fn test_missing_directory_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gone = dir.path().join("nope");
        let result = wait_for_file(&gone, "cookie").await;
        assert!(matches!(result, Err(Error::Filesystem(_))));
    }
}
