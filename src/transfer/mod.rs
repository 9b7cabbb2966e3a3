// (c) 2025 Ross Younger

//! Bulk transfer engines
//!
//! Firmware upload and file upload share one sliding-window engine
//! ([upload]); file download is a sequential fetch loop ([download]).
//! Both report progress through a caller-supplied callback and both are
//! driven entirely by the offsets the device acknowledges, which is what
//! makes them resilient to lost and replayed frames.

use std::time::Duration;

pub(crate) mod download;
pub(crate) mod upload;

/// Progress callback: invoked with the completed fraction in `[0, 1]`,
/// monotonically non-decreasing, reaching 1.0 exactly when the transfer
/// completes.
pub type Progress = Box<dyn FnMut(f64) + Send>;

/// Default per-request deadline for transfer chunks
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default chunk budget: safely below the 512-byte SMP buffer BLE
/// deployments commonly configure. Callers who have queried
/// [`params`](crate::SmpClient::params) should pass the real value.
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 512;
