//! Abstract tile byte fetch and the built-in fetchers
//!
//! The core treats transport as opaque I/O: a fetcher resolves a byte range
//! to payload bytes or a [`FetchError`], asynchronously. Concurrency and
//! retries live in the download manager, not here.

use std::collections::HashMap;
use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::core::error::FetchError;
use crate::tiles::tree::ByteRange;

/// Boxed future returned by [`TileFetcher::fetch`]
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, FetchError>> + Send>>;

/// Asynchronous byte-range source for tile payloads
pub trait TileFetcher: Send + Sync + 'static {
    fn fetch(&self, range: ByteRange) -> FetchFuture;
}

/// Reads tile payloads from a packaged model file on disk
pub struct FileFetcher {
    path: PathBuf,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl TileFetcher for FileFetcher {
    fn fetch(&self, range: ByteRange) -> FetchFuture {
        let path = self.path.clone();
        Box::pin(async move {
            use tokio::io::{AsyncReadExt, AsyncSeekExt};

            let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    FetchError::NotFound
                } else {
                    FetchError::Io(e)
                }
            })?;

            file.seek(SeekFrom::Start(range.offset))
                .await
                .map_err(FetchError::Io)?;

            let mut buf = vec![0u8; range.len as usize];
            file.read_exact(&mut buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    FetchError::NotFound
                } else {
                    FetchError::Io(e)
                }
            })?;

            Ok(buf)
        })
    }
}

/// In-memory fetcher over a packaged model blob, with scriptable failures.
///
/// Used by tests and benches to drive the scheduler deterministically:
/// `fail_times` makes the next N fetches of a given offset error out before
/// the data comes through.
pub struct MemoryFetcher {
    blob: Arc<Vec<u8>>,
    failures: Mutex<HashMap<u64, u32>>,
    delay: Option<std::time::Duration>,
}

impl MemoryFetcher {
    pub fn new(blob: Vec<u8>) -> Self {
        Self {
            blob: Arc::new(blob),
            failures: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    /// Add artificial latency to every fetch
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next `times` fetches starting at `offset` fail
    pub fn fail_times(&self, offset: u64, times: u32) {
        self.failures.lock().unwrap().insert(offset, times);
    }
}

impl TileFetcher for MemoryFetcher {
    fn fetch(&self, range: ByteRange) -> FetchFuture {
        let injected = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&range.offset) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        let blob = self.blob.clone();
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if injected {
                return Err(FetchError::Transport("injected failure".into()));
            }

            let start = range.offset as usize;
            let end = start + range.len as usize;
            if end > blob.len() {
                return Err(FetchError::NotFound);
            }
            Ok(blob[start..end].to_vec())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_fetcher_slices_blob() {
        let fetcher = MemoryFetcher::new((0u8..=255).collect());

        let bytes = fetcher.fetch(ByteRange::new(10, 4)).await.expect("fetch");
        assert_eq!(bytes, vec![10, 11, 12, 13]);
    }

    #[tokio::test]
    async fn test_memory_fetcher_out_of_range() {
        let fetcher = MemoryFetcher::new(vec![0u8; 16]);

        let result = fetcher.fetch(ByteRange::new(10, 10)).await;
        assert!(matches!(result, Err(FetchError::NotFound)));
    }

    #[tokio::test]
    async fn test_memory_fetcher_injected_failures_then_success() {
        let fetcher = MemoryFetcher::new(vec![7u8; 16]);
        fetcher.fail_times(0, 2);

        assert!(matches!(
            fetcher.fetch(ByteRange::new(0, 4)).await,
            Err(FetchError::Transport(_))
        ));
        assert!(matches!(
            fetcher.fetch(ByteRange::new(0, 4)).await,
            Err(FetchError::Transport(_))
        ));
        assert_eq!(fetcher.fetch(ByteRange::new(0, 4)).await.expect("fetch"), vec![7u8; 4]);
    }

    #[tokio::test]
    async fn test_file_fetcher_reads_range() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&(0u8..=99).collect::<Vec<u8>>()).expect("write");

        let fetcher = FileFetcher::new(file.path());
        let bytes = fetcher.fetch(ByteRange::new(50, 5)).await.expect("fetch");
        assert_eq!(bytes, vec![50, 51, 52, 53, 54]);
    }

    #[tokio::test]
    async fn test_file_fetcher_missing_file() {
        let fetcher = FileFetcher::new("/definitely/not/here.splat");
        let result = fetcher.fetch(ByteRange::new(0, 4)).await;
        assert!(matches!(result, Err(FetchError::NotFound)));
    }

    #[tokio::test]
    async fn test_file_fetcher_short_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&[1, 2, 3]).expect("write");

        let fetcher = FileFetcher::new(file.path());
        let result = fetcher.fetch(ByteRange::new(0, 10)).await;
        assert!(matches!(result, Err(FetchError::NotFound)));
    }
}
