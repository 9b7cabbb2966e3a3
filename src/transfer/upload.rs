// (c) 2025 Ross Younger

//! Sliding-window upload engine
//!
//! Chunks are written without waiting for their predecessors' replies, up to
//! a window of `W` in flight. The device acknowledges each chunk with the
//! next offset it expects; because that acknowledgement is cumulative, a
//! single reply can settle several outstanding chunks, and a reply naming an
//! offset we have not sent yet tells us the intervening bytes were lost and
//! must be re-sent.
//!
//! The engine keeps an ordered list of in-flight spans. On each reply:
//!
//! 1. If the replied-to chunk is no longer in the list it was superseded;
//!    ignore it.
//! 2. Drop the chunk and everything before it (cumulative ack).
//! 3. Drop list entries from the front until the head starts at the
//!    acknowledged offset; those bytes never arrived.
//! 4. Resume sending from the end of the list (or the acknowledged offset
//!    if the list emptied) until the window is full again.
//!
//! Chunk sizing is dynamic: each chunk carries as much data as fits in the
//! device's buffer after the CBOR fields it travels with, which differ
//! between the first chunk and continuations.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::client::SmpClient;
use crate::client::fs::FileChunks;
use crate::client::image::ImageChunks;
use crate::protocol::{HEADER_LEN, Op, PayloadExt as _, PayloadMap, SmpFrame, payload_len};
use crate::{Error, Result};

use super::{DEFAULT_CHUNK_SIZE, DEFAULT_TIMEOUT, Progress};

/// Two bytes of slack for the map head, mirroring how devices account
/// for their receive buffers.
const FRAMING_SLACK: usize = 2;

/// What varies between firmware upload and file upload: the request payload
/// each chunk travels in.
pub(crate) trait ChunkFormat: Send + Sync + 'static {
    /// Command group the chunks are addressed to
    fn group(&self) -> u16;
    /// Command id within the group
    fn id(&self) -> u8;
    /// Builds the payload for the chunk at `off`. The first chunk
    /// (`off == 0`) carries the transfer preamble; continuations are lean.
    fn payload(&self, off: usize, chunk: &[u8], total: usize) -> PayloadMap;

    /// Wire overhead of the chunk at `off`, excluding the data bytes
    /// themselves: the CBOR encoding of the other fields this chunk would
    /// carry, the fixed frame header, and the map slack.
    fn overhead(&self, off: usize, total: usize) -> usize {
        payload_len(&self.payload(off, &[], total)) + HEADER_LEN + FRAMING_SLACK
    }
}

/// One in-flight chunk: the half-open byte range it carries, and a serial
/// number telling this instance apart from a later re-send of the same range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    off: usize,
    end: usize,
    serial: u64,
}

pub(crate) struct WindowedUpload<F: ChunkFormat> {
    pub(crate) client: SmpClient,
    pub(crate) format: F,
    pub(crate) chunk_size: usize,
    pub(crate) window: usize,
    pub(crate) timeout: Duration,
    pub(crate) progress: Option<Progress>,
}

impl<F: ChunkFormat> WindowedUpload<F> {
    pub(crate) async fn run(mut self, data: &[u8]) -> Result<()> {
        let total = data.len();
        let window = self.window.max(1);
        let mut tasks: JoinSet<(Span, Result<SmpFrame>)> = JoinSet::new();
        let mut pending: VecDeque<Span> = VecDeque::new();
        let mut resume = 0usize;
        let mut started = false;
        let mut reported = 0usize;
        let mut serial = 0u64;

        loop {
            // Keep the window full. Chunks go out in ascending offset order
            // and nothing here waits for them.
            while pending.len() < window {
                let off = pending.back().map_or(resume, |c| c.end);
                if started && off >= total {
                    break;
                }
                let budget = self.budget_at(off, total)?;
                let end = total.min(off + budget);
                let span = Span { off, end, serial };
                serial += 1;
                trace!("issue chunk {off}..{end} of {total}");
                let frame = SmpFrame::request(
                    Op::Write,
                    self.format.group(),
                    self.format.id(),
                    self.format.payload(off, &data[off..end], total),
                );
                let client = self.client.clone();
                let timeout = self.timeout;
                let _ = tasks.spawn(async move { (span, client.execute(frame, timeout).await) });
                pending.push_back(span);
                started = true;
            }

            let Some(joined) = tasks.join_next().await else {
                return Err(Error::UnexpectedPayload(
                    "transfer stalled with nothing in flight".into(),
                ));
            };
            let Ok((span, result)) = joined else {
                continue; // task was aborted
            };
            let Some(idx) = pending.iter().position(|c| *c == span) else {
                continue; // chunk was superseded; its fate no longer matters
            };

            let acked: Result<usize> = result.and_then(|frame| {
                frame.payload.check_rc()?;
                let n = frame.payload.u64_field("off")?;
                let n = usize::try_from(n).map_err(|_| {
                    Error::UnexpectedPayload(format!("acknowledged offset {n} out of range"))
                })?;
                if n > total {
                    return Err(Error::UnexpectedPayload(format!(
                        "acknowledged offset {n} beyond end of data ({total})"
                    )));
                }
                Ok(n)
            });
            let next = match acked {
                Ok(next) => next,
                Err(e) => {
                    tasks.abort_all();
                    pending.clear();
                    return Err(e);
                }
            };

            // Cumulative ack: this chunk and everything before it is settled.
            let _ = pending.drain(..=idx);
            // If the device expects an offset behind our queue head, the
            // intervening chunks never arrived; drop them for re-send.
            while pending.front().is_some_and(|c| c.off != next) {
                let dropped = pending.pop_front();
                debug!("resync: device expects {next}, dropping in-flight {dropped:?}");
            }
            resume = pending.back().map_or(next, |c| c.end);

            if next >= reported {
                reported = next;
                if let Some(cb) = self.progress.as_mut() {
                    #[allow(clippy::cast_precision_loss)]
                    let fraction = if total == 0 {
                        1.0
                    } else {
                        next as f64 / total as f64
                    };
                    cb(fraction);
                }
            }
            if next == total {
                debug_assert!(pending.is_empty());
                tasks.abort_all();
                return Ok(());
            }
        }
    }

    /// Maximum data bytes for the chunk at `off`
    fn budget_at(&self, off: usize, total: usize) -> Result<usize> {
        let budget = self
            .chunk_size
            .saturating_sub(self.format.overhead(off, total));
        if budget == 0 {
            return Err(Error::BufferTooSmall);
        }
        Ok(budget)
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// PUBLIC JOB DESCRIPTIONS

/// Parameters for a firmware image upload
pub struct ImageUpload<'a> {
    /// Target image number (0 on single-image devices)
    pub image: u32,
    /// The complete image binary
    pub data: &'a [u8],
    /// The image's MCUboot TLV hash. Not sent during upload; carried here so
    /// callers can chain straight into
    /// [`set_pending_image`](SmpClient::set_pending_image) afterwards.
    pub hash: &'a [u8],
    /// SHA-256 of `data`, sent with the first chunk so the device can resume
    /// a previously interrupted transfer. Empty to omit.
    pub sha: &'a [u8],
    /// The device's management buffer size, bounding each request frame
    pub chunk_size: usize,
    /// Maximum chunks in flight
    pub window: usize,
    /// Progress callback
    pub on_progress: Option<Progress>,
    /// Per-chunk deadline
    pub timeout: Duration,
}

impl<'a> ImageUpload<'a> {
    /// New upload job with default sizing (one chunk in flight,
    /// conservative chunk size, 5 s per-chunk deadline)
    #[must_use]
    pub fn new(image: u32, data: &'a [u8]) -> Self {
        ImageUpload {
            image,
            data,
            hash: &[],
            sha: &[],
            chunk_size: DEFAULT_CHUNK_SIZE,
            window: 1,
            on_progress: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the TLV hash
    #[must_use]
    pub fn with_hash(mut self, hash: &'a [u8]) -> Self {
        self.hash = hash;
        self
    }

    /// Sets the whole-binary SHA-256
    #[must_use]
    pub fn with_sha(mut self, sha: &'a [u8]) -> Self {
        self.sha = sha;
        self
    }

    /// Sets the chunk budget (typically the device's
    /// [`buf_size`](crate::BufferParams::buf_size))
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the window of chunks kept in flight
    #[must_use]
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
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

/// Parameters for writing a blob to the device filesystem
pub struct DataUpload<'a> {
    /// Destination path on the device, e.g. `/lfs/settings.bin`
    pub path: &'a str,
    /// The data to write
    pub data: &'a [u8],
    /// The device's management buffer size, bounding each request frame
    pub chunk_size: usize,
    /// Maximum chunks in flight
    pub window: usize,
    /// Progress callback
    pub on_progress: Option<Progress>,
    /// Per-chunk deadline
    pub timeout: Duration,
}

impl<'a> DataUpload<'a> {
    /// New upload job with default sizing
    #[must_use]
    pub fn new(path: &'a str, data: &'a [u8]) -> Self {
        DataUpload {
            path,
            data,
            chunk_size: DEFAULT_CHUNK_SIZE,
            window: 1,
            on_progress: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the chunk budget
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the window of chunks kept in flight
    #[must_use]
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
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
    /// Uploads a firmware image into the given image's inactive slot.
    ///
    /// Aborting is as simple as dropping the returned future: in-flight
    /// chunks are cancelled and their router slots released. A failed chunk
    /// (device error or per-chunk timeout) aborts the whole transfer but
    /// leaves the client usable.
    pub async fn upload_image(&self, job: ImageUpload<'_>) -> Result<()> {
        let format = ImageChunks {
            image: job.image,
            sha: if job.sha.is_empty() {
                None
            } else {
                Some(job.sha.to_vec())
            },
        };
        WindowedUpload {
            client: self.clone(),
            format,
            chunk_size: job.chunk_size,
            window: job.window,
            timeout: job.timeout,
            progress: job.on_progress,
        }
        .run(job.data)
        .await
    }

    /// Writes a blob to a file on the device filesystem
    pub async fn upload_data(&self, job: DataUpload<'_>) -> Result<()> {
        let format = FileChunks {
            name: job.path.to_string(),
        };
        WindowedUpload {
            client: self.clone(),
            format,
            chunk_size: job.chunk_size,
            window: job.window,
            timeout: job.timeout,
            progress: job.on_progress,
        }
        .run(job.data)
        .await
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::{ChunkFormat, ImageUpload, WindowedUpload};
    use crate::client::SmpClient;
    use crate::client::test_device::{next_request, response_to};
    use crate::payload;
    use crate::protocol::{PayloadExt as _, PayloadMap, SmpFrame};
    use crate::transport::FrameSink as _;
    use crate::transport::memory::{MemoryPair, memory_pair};
    use crate::{DataUpload, Error};
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const SNAPPY: Duration = Duration::from_millis(500);

    /// A format with a constant, declared overhead so tests can pick exact
    /// chunk sizes.
    struct FixedFormat {
        overhead: usize,
    }

    impl ChunkFormat for FixedFormat {
        fn group(&self) -> u16 {
            1
        }
        fn id(&self) -> u8 {
            1
        }
        fn payload(&self, off: usize, chunk: &[u8], total: usize) -> PayloadMap {
            if off == 0 {
                payload! { "data" => chunk, "len" => total, "off" => 0u64 }
            } else {
                payload! { "data" => chunk, "off" => off }
            }
        }
        fn overhead(&self, _off: usize, _total: usize) -> usize {
            self.overhead
        }
    }

    fn progress_recorder() -> (Arc<Mutex<Vec<f64>>>, super::Progress) {
        let record = Arc::new(Mutex::new(Vec::new()));
        let writer = record.clone();
        let cb = Box::new(move |f: f64| writer.lock().unwrap().push(f));
        (record, cb)
    }

    fn upload_256(client: &SmpClient, window: usize, progress: Option<super::Progress>)
    -> WindowedUpload<FixedFormat> {
        WindowedUpload {
            client: client.clone(),
            format: FixedFormat { overhead: 44 },
            chunk_size: 300, // yields exactly 256 data bytes per chunk
            window,
            timeout: SNAPPY,
            progress,
        }
    }

    async fn ack(pair: &mut MemoryPair, req: &SmpFrame, off: u64) {
        let rsp = response_to(req, payload! { "off" => off });
        pair.send.send_frame(rsp).await.unwrap();
    }

    fn chunk_range(req: &SmpFrame) -> (u64, u64) {
        let off = req.payload.u64_field("off").unwrap();
        let len = req.payload.bytes_field("data").unwrap().len() as u64;
        (off, off + len)
    }

    #[tokio::test]
    async fn windowed_upload_progress() {
        let (ours, mut theirs) = memory_pair();
        let client = SmpClient::open(ours);
        let data = vec![7u8; 1024];
        let (record, cb) = progress_recorder();

        // acknowledge each chunk as received, in arrival order
        let device = tokio::spawn(async move {
            let mut received = Vec::new();
            loop {
                let Some(req) = next_request(&mut theirs).await else {
                    break;
                };
                let (off, end) = chunk_range(&req);
                received.push((off, end));
                ack(&mut theirs, &req, end).await;
                if end == 1024 {
                    break;
                }
            }
            received
        });

        upload_256(&client, 3, Some(cb)).run(&data).await.unwrap();
        let received = device.await.unwrap();
        assert_eq!(received, vec![(0, 256), (256, 512), (512, 768), (768, 1024)]);
        assert_eq!(*record.lock().unwrap(), vec![0.25, 0.5, 0.75, 1.0]);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn window_bound_is_respected() {
        let (ours, mut theirs) = memory_pair();
        let client = SmpClient::open(ours);
        let data = vec![1u8; 1024];

        let device = tokio::spawn(async move {
            // with W=2, exactly two chunks arrive before we acknowledge anything
            let first = next_request(&mut theirs).await.unwrap();
            let second = next_request(&mut theirs).await.unwrap();
            let extra =
                tokio::time::timeout(Duration::from_millis(100), next_request(&mut theirs)).await;
            assert!(extra.is_err(), "third chunk sent before window opened");

            ack(&mut theirs, &first, chunk_range(&first).1).await;
            let third = next_request(&mut theirs).await.unwrap();
            ack(&mut theirs, &second, chunk_range(&second).1).await;
            ack(&mut theirs, &third, chunk_range(&third).1).await;
            let fourth = next_request(&mut theirs).await.unwrap();
            ack(&mut theirs, &fourth, 1024).await;
            theirs
        });

        upload_256(&client, 2, None).run(&data).await.unwrap();
        drop(device.await.unwrap());
    }

    #[tokio::test]
    async fn resync_after_skipped_ack() {
        let (ours, mut theirs) = memory_pair();
        let client = SmpClient::open(ours);
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let (record, cb) = progress_recorder();

        let expected = data.clone();
        let device = tokio::spawn(async move {
            let mut assembled = vec![0u8; 1024];
            let mut store = |req: &SmpFrame| {
                let (off, end) = chunk_range(req);
                let bytes = req.payload.bytes_field("data").unwrap();
                assembled[usize::try_from(off).unwrap()..usize::try_from(end).unwrap()]
                    .copy_from_slice(bytes);
                (off, end)
            };
            // window 3: chunks A(0..256), B(256..512), C(512..768) arrive
            let a = next_request(&mut theirs).await.unwrap();
            let b = next_request(&mut theirs).await.unwrap();
            let c = next_request(&mut theirs).await.unwrap();
            let _ = store(&a);
            let _ = store(&b);
            let _ = store(&c);
            // reply to A as though B had already landed via a replay:
            // the uploader must prune to C and resume from 768
            ack(&mut theirs, &a, 512).await;
            let d = next_request(&mut theirs).await.unwrap();
            let (_, d_end) = store(&d);
            assert_eq!(d_end, 1024, "resumed chunk should start at 768");
            ack(&mut theirs, &c, 768).await;
            ack(&mut theirs, &d, 1024).await;
            assembled
        });

        upload_256(&client, 3, Some(cb)).run(&data).await.unwrap();
        let assembled = device.await.unwrap();
        assert_eq!(assembled, expected, "every byte delivered exactly once");
        let record = record.lock().unwrap();
        assert_eq!(*record, vec![0.5, 0.75, 1.0]);
        assert!(record.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn device_moving_backwards_forces_resend() {
        let (ours, mut theirs) = memory_pair();
        let client = SmpClient::open(ours);
        let data = vec![9u8; 512];

        let device = tokio::spawn(async move {
            let a = next_request(&mut theirs).await.unwrap();
            let b = next_request(&mut theirs).await.unwrap();
            // the device lost chunk B; it acknowledges B with A's end offset
            ack(&mut theirs, &b, chunk_range(&a).1).await;
            // B's bytes come again
            let b2 = next_request(&mut theirs).await.unwrap();
            assert_eq!(chunk_range(&b2), chunk_range(&b));
            ack(&mut theirs, &b2, 512).await;
            theirs
        });

        upload_256(&client, 2, None).run(&data).await.unwrap();
        drop(device.await.unwrap());
    }

    #[tokio::test]
    async fn empty_upload_sends_one_chunk() {
        let (ours, mut theirs) = memory_pair();
        let client = SmpClient::open(ours);
        let (record, cb) = progress_recorder();

        let device = tokio::spawn(async move {
            let req = next_request(&mut theirs).await.unwrap();
            assert_eq!(req.payload.u64_field("len").unwrap(), 0);
            assert!(req.payload.bytes_field("data").unwrap().is_empty());
            ack(&mut theirs, &req, 0).await;
            theirs
        });

        upload_256(&client, 1, Some(cb)).run(&[]).await.unwrap();
        assert_eq!(*record.lock().unwrap(), vec![1.0]);
        drop(device.await.unwrap());
    }

    #[tokio::test]
    async fn device_error_aborts_transfer() {
        let (ours, mut theirs) = memory_pair();
        let client = SmpClient::open(ours);
        let data = vec![3u8; 1024];

        let device = tokio::spawn(async move {
            let req = next_request(&mut theirs).await.unwrap();
            let rsp = response_to(&req, payload! { "rc" => 9u64 });
            theirs.send.send_frame(rsp).await.unwrap();
            theirs
        });

        let result = upload_256(&client, 3, None).run(&data).await;
        assert!(matches!(result, Err(Error::Device(9))));
        // the client survives an aborted transfer
        drop(device.await.unwrap());
        assert!(matches!(
            client.echo("alive", Duration::from_millis(50)).await,
            Err(Error::Timeout) | Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn chunk_timeout_aborts_transfer() {
        let (ours, theirs) = memory_pair();
        let client = SmpClient::open(ours);
        let data = vec![3u8; 512];

        let mut job = upload_256(&client, 2, None);
        job.timeout = Duration::from_millis(20);
        let result = job.run(&data).await;
        assert!(matches!(result, Err(Error::Timeout)));
        drop(theirs);
    }

    #[tokio::test]
    async fn buffer_too_small() {
        let (ours, theirs) = memory_pair();
        let client = SmpClient::open(ours);
        let job = ImageUpload::new(0, &[1, 2, 3]).with_chunk_size(10);
        assert!(matches!(
            client.upload_image(job).await,
            Err(Error::BufferTooSmall)
        ));
        drop(theirs);
    }

    /// End-to-end through the real image chunk format: dynamic sizing must
    /// keep every frame within the device buffer, and the reassembled bytes
    /// must match.
    #[tokio::test]
    async fn image_upload_respects_device_buffer() {
        let (ours, mut theirs) = memory_pair();
        let client = SmpClient::open(ours);
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 241) as u8).collect();
        let sha = vec![0xEE; 32];

        let expected = data.clone();
        let device = tokio::spawn(async move {
            let mut assembled = Vec::new();
            loop {
                let req = next_request(&mut theirs).await.unwrap();
                assert!(
                    req.encode().unwrap().len() <= 200 + super::FRAMING_SLACK,
                    "frame exceeds device buffer"
                );
                let (off, end) = chunk_range(&req);
                if off == 0 {
                    assert_eq!(req.payload.u64_field("len").unwrap(), 2000);
                    assert_eq!(req.payload.u64_field("image").unwrap(), 0);
                    assert_eq!(req.payload.bytes_field("sha").unwrap(), &[0xEE; 32]);
                }
                assert_eq!(off as usize, assembled.len(), "chunks must be contiguous");
                assembled.extend_from_slice(req.payload.bytes_field("data").unwrap());
                ack(&mut theirs, &req, end).await;
                if end == 2000 {
                    break;
                }
            }
            assembled
        });

        let job = ImageUpload::new(0, &data)
            .with_sha(&sha)
            .with_chunk_size(200)
            .with_window(2);
        client.upload_image(job).await.unwrap();
        assert_eq!(device.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn file_upload_names_every_chunk() {
        let (ours, mut theirs) = memory_pair();
        let client = SmpClient::open(ours);
        let data = vec![5u8; 700];

        let device = tokio::spawn(async move {
            let mut received = 0u64;
            loop {
                let req = next_request(&mut theirs).await.unwrap();
                assert_eq!(req.payload.str_field("name").unwrap(), "/lfs/blob.bin");
                let (off, end) = chunk_range(&req);
                assert_eq!(off, received);
                received = end;
                ack(&mut theirs, &req, end).await;
                if end == 700 {
                    break;
                }
            }
            received
        });

        let job = DataUpload::new("/lfs/blob.bin", &data).with_chunk_size(256);
        client.upload_data(job).await.unwrap();
        assert_eq!(device.await.unwrap(), 700);
    }
}
