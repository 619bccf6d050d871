//! Streaming and download options for sicar-dl
//!
//! Provides the AsyncRead adapter for HTTP bodies and the knobs that shape a
//! municipality download.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use tokio::io::AsyncRead;

/// Attempts per municipality before giving up
pub const DEFAULT_TRIES: u32 = 25;

/// Upper bound of the random pause between attempts
pub const DEFAULT_RETRY_JITTER: Duration = Duration::from_secs(2);

/// Response body as an async reader
pub type DownloadStream = Box<dyn AsyncRead + Send + Unpin>;

/// Progress callback function type
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Overwrite behavior for existing files
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum OverwriteBehavior {
    /// Prompt user for confirmation (default)
    #[default]
    Prompt,
    /// Force overwrite without prompting
    Force,
    /// Never overwrite, fail if file exists
    NeverOverwrite,
}

/// Options for download operations
#[derive(Clone)]
pub struct DownloadOptions {
    /// Optional progress callback
    pub progress: Option<ProgressCallback>,

    /// Buffer size for streaming operations
    pub buffer_size: usize,

    /// Behavior when destination file already exists
    pub overwrite: OverwriteBehavior,

    /// Captcha/download attempts per municipality
    pub tries: u32,

    /// Maximum random pause between attempts
    pub retry_jitter: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            progress: None,
            buffer_size: 64 * 1024, // 64KB
            overwrite: OverwriteBehavior::default(),
            tries: DEFAULT_TRIES,
            retry_jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

impl std::fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("progress", &self.progress.is_some())
            .field("buffer_size", &self.buffer_size)
            .field("overwrite", &self.overwrite)
            .field("tries", &self.tries)
            .field("retry_jitter", &self.retry_jitter)
            .finish()
    }
}

/// Creates a DownloadStream from an HTTP response
pub fn create_http_stream(response: reqwest::Response) -> DownloadStream {
    Box::new(tokio_util::io::StreamReader::new(
        response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    ))
}
