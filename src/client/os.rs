// (c) 2025 Ross Younger

//! OS management group (group 0)

use std::time::Duration;

use tracing::debug;

use super::SmpClient;
use crate::payload;
use crate::protocol::{Op, PayloadExt as _, SmpFrame, group};
use crate::{Error, Result};

const ECHO: u8 = 0;
const RESET: u8 = 5;
const MCUMGR_PARAMS: u8 = 6;

/// The device's management buffer configuration, which bounds how big a
/// single request frame may be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferParams {
    /// Size in bytes of one management buffer
    pub buf_size: u32,
    /// Number of buffers
    pub buf_count: u32,
}

impl Default for BufferParams {
    /// The conservative assumption for devices that do not implement the
    /// parameter query
    fn default() -> Self {
        BufferParams {
            buf_size: 20,
            buf_count: 1,
        }
    }
}

impl SmpClient {
    /// Round-trips a text message through the device
    pub async fn echo(&self, message: &str, timeout: Duration) -> Result<String> {
        let request = SmpFrame::request(Op::Write, group::OS, ECHO, payload! { "d" => message });
        let response = self.execute(request, timeout).await?;
        response.payload.check_rc()?;
        Ok(response.payload.str_field("r")?.to_string())
    }

    /// Reboots the device.
    ///
    /// Many devices drop the link before the response makes it out; a
    /// transport failure while waiting is therefore treated as success.
    pub async fn reset(&self, timeout: Duration) -> Result<()> {
        let request = SmpFrame::request(Op::Write, group::OS, RESET, payload! {});
        match self.execute(request, timeout).await {
            Ok(response) => response.payload.check_rc(),
            Err(Error::Transport(cause)) => {
                debug!("link dropped awaiting reset response (device rebooting): {cause}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Queries the device's management buffer configuration.
    ///
    /// Older firmware does not implement this and answers with an error
    /// `rc`; callers wanting a fallback should use
    /// [`params_or_default`](Self::params_or_default).
    pub async fn params(&self, timeout: Duration) -> Result<BufferParams> {
        let request = SmpFrame::request(Op::Read, group::OS, MCUMGR_PARAMS, payload! {});
        let response = self.execute(request, timeout).await?;
        response.payload.check_rc()?;
        Ok(BufferParams {
            buf_size: field_u32(&response, "buf_size")?,
            buf_count: field_u32(&response, "buf_count")?,
        })
    }

    /// [`params`](Self::params), falling back to [`BufferParams::default`]
    /// when the device cannot answer
    pub async fn params_or_default(&self, timeout: Duration) -> BufferParams {
        match self.params(timeout).await {
            Ok(params) => params,
            Err(e) => {
                debug!("buffer parameter query failed ({e}); using defaults");
                BufferParams::default()
            }
        }
    }
}

fn field_u32(response: &SmpFrame, key: &str) -> Result<u32> {
    let v = response.payload.u64_field(key)?;
    u32::try_from(v).map_err(|_| Error::UnexpectedPayload(format!("{key} {v} out of range")))
}
