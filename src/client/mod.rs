// (c) 2025 Ross Younger

//! The SMP client proper
//!
//! [`SmpClient`] owns the write half of a transport and a background task
//! draining the read half. Any number of operations may be issued
//! concurrently from clones of the client; writes are serialised on the
//! sink, waits proceed independently, and the
//! [router](router) pairs each response with its caller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

pub(crate) mod fs;
pub(crate) mod image;
pub(crate) mod os;
mod router;

pub use image::{ImageSlot, ImageState};

use crate::protocol::SmpFrame;
use crate::transport::{FramePair, FrameSink, FrameSource};
use crate::{Error, Result};

/// A connected MCUmgr client.
///
/// Cheap to clone; all clones share the same transport and pending-request
/// table. The client holds no global state whatsoever; open as many as you
/// have devices.
///
/// Must be opened from within a tokio runtime, which hosts the receive task.
#[derive(Clone)]
pub struct SmpClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) router: router::Router,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl SmpClient {
    /// Takes ownership of a transport and starts the receive loop.
    pub fn open<S, R>(transport: FramePair<S, R>) -> Self
    where
        S: FrameSink + 'static,
        R: FrameSource + 'static,
    {
        let FramePair { send, recv } = transport;
        let inner = Arc::new(ClientInner {
            router: router::Router::default(),
            sink: tokio::sync::Mutex::new(Box::new(send)),
            recv_task: Mutex::new(None),
        });
        let task = tokio::spawn(router::run_receiver(recv, Arc::downgrade(&inner)));
        *inner.recv_task.lock().expect("recv task slot poisoned") = Some(task);
        SmpClient { inner }
    }

    /// Sends a request and waits for the matching response.
    ///
    /// The frame's sequence number is assigned here. `timeout` runs from the
    /// moment the request is registered; on expiry the pending entry is
    /// released and any late response is discarded.
    pub async fn execute(&self, mut frame: SmpFrame, timeout: Duration) -> Result<SmpFrame> {
        let (reservation, mut rx) = self.inner.router.register(&mut frame.header)?;
        let wire = frame.encode()?;
        trace!("send {frame}");
        enum Phase {
            Sent(Result<()>),
            // a verdict arriving before the write finishes only happens at shutdown
            Early(Result<SmpFrame>),
        }
        let outcome = tokio::time::timeout(timeout, async {
            let send = async {
                let mut sink = self.inner.sink.lock().await;
                sink.send_frame(wire).await
            };
            // Drive the send, but bail out if shutdown resolves us first;
            // otherwise a write stalled on a dead link would pin the sink.
            let phase = tokio::select! {
                sent = send => Phase::Sent(sent),
                verdict = &mut rx => Phase::Early(verdict.unwrap_or(Err(Error::Closed))),
            };
            match phase {
                Phase::Early(verdict) => verdict,
                Phase::Sent(Ok(())) => rx.await.unwrap_or(Err(Error::Closed)),
                Phase::Sent(Err(e)) => {
                    if matches!(e, Error::Transport(_)) {
                        self.inner.router.fail_all(e.clone());
                    }
                    Err(e)
                }
            }
        })
        .await
        .unwrap_or(Err(Error::Timeout));
        drop(reservation);
        outcome
    }

    /// Shuts the client down: stops the receive task, fails every pending
    /// request with [`Error::Closed`], and closes the transport.
    ///
    /// Idempotent; a second call is a no-op.
    pub async fn close(&self) -> Result<()> {
        let task = self
            .inner
            .recv_task
            .lock()
            .expect("recv task slot poisoned")
            .take();
        let Some(task) = task else {
            return Ok(());
        };
        task.abort();
        self.inner.router.fail_all(Error::Closed);
        let mut sink = self.inner.sink.lock().await;
        sink.close().await
    }

    #[cfg(test)]
    pub(crate) fn pending_requests(&self) -> usize {
        self.inner.router.pending_len()
    }
}

#[cfg(test)]
pub(crate) mod test_device {
    //! Scripted device-side helpers for loopback tests

    use crate::protocol::{Op, PayloadMap, SmpFrame};
    use crate::transport::FrameSource as _;
    use crate::transport::memory::MemoryPair;

    /// Reads and decodes the next request arriving at the device side
    pub(crate) async fn next_request(pair: &mut MemoryPair) -> Option<SmpFrame> {
        pair.recv
            .next_frame()
            .await
            .unwrap()
            .map(|raw| SmpFrame::decode(&raw).unwrap())
    }

    /// Builds the wire encoding of a response to `request` carrying `payload`
    pub(crate) fn response_to(request: &SmpFrame, payload: PayloadMap) -> Vec<u8> {
        let op = match request.header.op {
            Op::Read => Op::ReadRsp,
            _ => Op::WriteRsp,
        };
        let mut frame = SmpFrame::request(op, request.header.group, request.header.id, payload);
        frame.header.sequence = request.header.sequence;
        frame.encode().unwrap()
    }
}
