// (c) 2025 Ross Younger

//! Sequential file download
//!
//! Downloads are driven one chunk at a time: the device dictates the pace
//! through its responses, and the first response carries the file's total
//! length, so there is nothing to be gained from a send window. The chunk
//! at offset 0 is requested first; thereafter each request names the offset
//! just past the bytes received so far.
//!
//! The device is expected to return contiguous ranges in ascending order.
//! A response that would push the byte count past the advertised length is
//! an [`Overrun`](Error::Overrun); a short or empty chunk before the end is
//! a protocol violation.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tracing::trace;

use crate::client::SmpClient;
use crate::{Error, Result};

use super::{DEFAULT_TIMEOUT, Progress};

/// Parameters for reading a file from the device filesystem
pub struct FileDownload<'a> {
    /// Path on the device, e.g. `/lfs/log.bin`
    pub path: &'a str,
    /// Progress callback
    pub on_progress: Option<Progress>,
    /// Per-chunk deadline. A single chunk timing out fails the download;
    /// there is no inter-chunk retry.
    pub timeout: Duration,
}

impl<'a> FileDownload<'a> {
    /// New download job with the default per-chunk deadline
    #[must_use]
    pub fn new(path: &'a str) -> Self {
        FileDownload {
            path,
            on_progress: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the per-chunk deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Installs a progress callback
    #[must_use]
    pub fn with_progress(mut self, f: impl FnMut(f64) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }
}

impl SmpClient {
    /// Reads a file from the device filesystem into `sink`.
    ///
    /// Returns the number of bytes transferred, which always equals the
    /// length the device advertised in its first response.
    pub async fn download_file<W>(&self, mut job: FileDownload<'_>, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut chunk = self.read_file_chunk(job.path, 0, job.timeout).await?;
        let Some(total) = chunk.len else {
            return Err(Error::UnexpectedPayload(
                "first chunk did not carry the file length".into(),
            ));
        };
        trace!("downloading {}: {total} bytes", job.path);

        let mut received = 0u64;
        loop {
            if chunk.off != received {
                return Err(Error::UnexpectedPayload(format!(
                    "chunk at offset {} but {received} bytes received",
                    chunk.off
                )));
            }
            if received + chunk.data.len() as u64 > total {
                return Err(Error::Overrun);
            }
            sink.write_all(&chunk.data).await?;
            received += chunk.data.len() as u64;

            if let Some(cb) = job.on_progress.as_mut() {
                #[allow(clippy::cast_precision_loss)]
                let fraction = if total == 0 {
                    1.0
                } else {
                    received as f64 / total as f64
                };
                cb(fraction);
            }
            if received >= total {
                break;
            }
            if chunk.data.is_empty() {
                return Err(Error::UnexpectedPayload(
                    "empty chunk before end of file".into(),
                ));
            }
            chunk = self.read_file_chunk(job.path, received, job.timeout).await?;
        }
        sink.flush().await?;
        Ok(total)
    }
}
