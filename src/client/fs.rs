// (c) 2025 Ross Younger

//! File management group (group 8)
//!
//! Files are moved in offset-addressed chunks through a single command id.
//! The response to the chunk at offset 0 additionally carries `len`, the
//! total file size, which is how a downloader learns how much to expect.

use std::time::Duration;

use super::SmpClient;
use crate::payload;
use crate::protocol::{Op, PayloadExt as _, PayloadMap, SmpFrame, group};
use crate::transfer::upload::ChunkFormat;
use crate::Result;

const FILE: u8 = 0;

/// One chunk of a file read
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FsChunk {
    /// Offset this chunk starts at
    pub(crate) off: u64,
    /// The chunk data
    pub(crate) data: Vec<u8>,
    /// Total file length; present only in the first response
    pub(crate) len: Option<u64>,
}

impl SmpClient {
    /// Reads one chunk of the file at `name`, starting at `off`
    pub(crate) async fn read_file_chunk(
        &self,
        name: &str,
        off: u64,
        timeout: Duration,
    ) -> Result<FsChunk> {
        let request = SmpFrame::request(
            Op::Read,
            group::FS,
            FILE,
            payload! { "name" => name, "off" => off },
        );
        let response = self.execute(request, timeout).await?;
        response.payload.check_rc()?;
        Ok(FsChunk {
            off: response.payload.u64_field("off")?,
            data: response.payload.bytes_field("data")?.to_vec(),
            len: response.payload.opt_u64_field("len")?,
        })
    }
}

/// Chunk payloads for file upload (group 8, id 0).
///
/// Every chunk names the file; the first one also announces the total size.
pub(crate) struct FileChunks {
    pub(crate) name: String,
}

impl ChunkFormat for FileChunks {
    fn group(&self) -> u16 {
        group::FS
    }

    fn id(&self) -> u8 {
        FILE
    }

    fn payload(&self, off: usize, chunk: &[u8], total: usize) -> PayloadMap {
        if off == 0 {
            payload! {
                "name" => self.name.as_str(),
                "data" => chunk,
                "len" => total,
                "off" => 0u64,
            }
        } else {
            payload! {
                "name" => self.name.as_str(),
                "data" => chunk,
                "off" => off,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FileChunks, FsChunk};
    use crate::client::SmpClient;
    use crate::client::test_device::{next_request, response_to};
    use crate::protocol::PayloadExt as _;
    use crate::transfer::upload::ChunkFormat as _;
    use crate::transport::FrameSink as _;
    use crate::transport::memory::memory_pair;
    use crate::payload;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const SNAPPY: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn read_chunk() {
        let (ours, mut theirs) = memory_pair();
        let client = SmpClient::open(ours);
        let device = tokio::spawn(async move {
            let req = next_request(&mut theirs).await.unwrap();
            assert_eq!(req.payload.str_field("name").unwrap(), "/lfs/config.txt");
            assert_eq!(req.payload.u64_field("off").unwrap(), 0);
            let rsp = response_to(
                &req,
                payload! { "off" => 0u64, "data" => vec![1u8, 2, 3], "len" => 300u64 },
            );
            theirs.send.send_frame(rsp).await.unwrap();
            theirs
        });
        let chunk = client
            .read_file_chunk("/lfs/config.txt", 0, SNAPPY)
            .await
            .unwrap();
        assert_eq!(
            chunk,
            FsChunk {
                off: 0,
                data: vec![1, 2, 3],
                len: Some(300),
            }
        );
        drop(device.await.unwrap());
    }

    #[test]
    fn chunk_payload_shapes() {
        let format = FileChunks {
            name: "/lfs/data.bin".into(),
        };
        let first = format.payload(0, &[1], 10);
        assert_eq!(first.str_field("name").unwrap(), "/lfs/data.bin");
        assert_eq!(first.u64_field("len").unwrap(), 10);
        let cont = format.payload(5, &[2], 10);
        assert_eq!(cont.str_field("name").unwrap(), "/lfs/data.bin");
        assert!(cont.get("len").is_none());
        assert_eq!(cont.u64_field("off").unwrap(), 5);
    }
}
