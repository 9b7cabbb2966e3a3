// (c) 2025 Ross Younger

//! Error taxonomy
//!
//! Devices report failures numerically (the `rc` payload field); everything
//! else that can go wrong is a property of the link or of local decoding.
//! All of it funnels into the one [`Error`] enum so callers can match on the
//! kind of failure without string-prodding.

use std::sync::Arc;

/// All the ways an smplink operation can fail.
///
/// The enum is `Clone` because a single transport failure has to be delivered
/// to every request that was in flight at the time.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The frame header or its CBOR payload could not be decoded
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A response payload was missing a required field, or a field had the wrong type
    #[error("unexpected payload: {0}")]
    UnexpectedPayload(String),

    /// The device reported a management error of the given numeric kind
    #[error("device error rc={0}")]
    Device(i32),

    /// The per-request deadline expired before a matching response arrived
    #[error("request timed out")]
    Timeout,

    /// The link failed.
    ///
    /// Note that this is the *expected* outcome of awaiting the response to a
    /// reset command; the device usually reboots before replying.
    #[error("transport failure: {0}")]
    Transport(#[source] Arc<std::io::Error>),

    /// The client was shut down while the request was pending
    #[error("client is closed")]
    Closed,

    /// All 256 sequence numbers are taken by in-flight requests
    #[error("too many requests in flight")]
    Overloaded,

    /// The negotiated MCUmgr buffer is too small to fit even one byte of
    /// chunk data after protocol overheads
    #[error("negotiated buffer cannot fit any chunk data")]
    BufferTooSmall,

    /// An MCUboot image or ZIP package failed to decode
    #[error("invalid firmware image: {0}")]
    Format(String),

    /// A download delivered more bytes than the device advertised
    #[error("device sent more data than advertised")]
    Overrun,

    /// Local I/O failure (e.g. writing a downloaded file to its sink)
    #[error("local I/O: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl Error {
    /// Wraps an I/O error as a transport failure
    #[must_use]
    pub fn transport(cause: std::io::Error) -> Self {
        Error::Transport(Arc::new(cause))
    }

    /// A transport failure with no underlying OS error, e.g. an orderly
    /// end-of-stream while requests were still outstanding.
    #[must_use]
    pub fn link_lost(what: &str) -> Self {
        Error::Transport(Arc::new(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            what.to_string(),
        )))
    }
}

impl From<std::io::Error> for Error {
    fn from(cause: std::io::Error) -> Self {
        Error::Io(Arc::new(cause))
    }
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;
    use pretty_assertions::assert_eq;

    #[test]
    fn display() {
        assert_eq!(Error::Device(8).to_string(), "device error rc=8");
        assert_eq!(Error::Timeout.to_string(), "request timed out");
        let e = Error::link_lost("frame stream ended");
        assert_eq!(e.to_string(), "transport failure: frame stream ended");
    }

    #[test]
    fn clones_share_cause() {
        let e = Error::transport(std::io::Error::other("gone"));
        let e2 = e.clone();
        assert_eq!(e.to_string(), e2.to_string());
    }
}
