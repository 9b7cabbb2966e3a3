// (c) 2025 Ross Younger

//! Transport abstraction
//!
//! The library is deliberately ignorant of what carries its frames. A BLE
//! GATT characteristic, a COBS-framed serial port and a UDP socket all look
//! the same from here: somewhere to push one complete SMP datagram at a
//! time, and somewhere complete datagrams arrive from.
//!
//! Implementations MUST NOT fragment or reassemble. One [`send_frame`] call
//! is one management datagram on the wire, and every element yielded by
//! [`next_frame`] is one complete datagram. MTU-level fragmentation (e.g.
//! BLE ATT packets) is the transport's own business and must be invisible
//! here.
//!
//! [`send_frame`]: FrameSink::send_frame
//! [`next_frame`]: FrameSource::next_frame

use async_trait::async_trait;

use crate::Result;

/// The outbound half of a transport: a sink of complete frames
#[async_trait]
pub trait FrameSink: Send {
    /// Sends one complete management frame.
    ///
    /// Link failures surface as [`Error::Transport`](crate::Error::Transport),
    /// which takes down the client and every pending request.
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Releases the link. Implementations for connectionless transports may
    /// not have anything to do.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The inbound half of a transport: a lazy source of complete frames
#[async_trait]
pub trait FrameSource: Send {
    /// Waits for the next complete frame.
    ///
    /// Returns `Ok(None)` on orderly end-of-stream (peer hung up), and
    /// `Err` on link failure. Either terminates the client's receive loop.
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Syntactic sugar helper type holding both halves of a transport
#[derive(Debug)]
pub struct FramePair<S: FrameSink, R: FrameSource> {
    /// outbound frames
    pub send: S,
    /// inbound frames
    pub recv: R,
}

impl<S: FrameSink, R: FrameSource> From<(S, R)> for FramePair<S, R> {
    fn from(value: (S, R)) -> Self {
        Self {
            send: value.0,
            recv: value.1,
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory loopback transport for tests.
    //!
    //! Two cross-connected channel pairs; each side of the function under
    //! test takes one receiver and the _opposite_ sender, so both sides see
    //! the full [`FrameSink`]/[`FrameSource`] contract.

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{FramePair, FrameSink, FrameSource};
    use crate::{Error, Result};

    pub(crate) struct ChannelSink {
        tx: Option<mpsc::Sender<Vec<u8>>>,
    }

    pub(crate) struct ChannelSource {
        rx: mpsc::Receiver<Vec<u8>>,
    }

    #[async_trait]
    impl FrameSink for ChannelSink {
        async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
            let tx = self
                .tx
                .as_ref()
                .ok_or_else(|| Error::link_lost("sink closed"))?;
            tx.send(frame)
                .await
                .map_err(|_| Error::link_lost("peer hung up"))
        }

        async fn close(&mut self) -> Result<()> {
            let _ = self.tx.take();
            Ok(())
        }
    }

    #[async_trait]
    impl FrameSource for ChannelSource {
        async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.rx.recv().await)
        }
    }

    pub(crate) type MemoryPair = FramePair<ChannelSink, ChannelSource>;

    /// Builds two connected endpoints. Frames sent on one arrive on the other.
    pub(crate) fn memory_pair() -> (MemoryPair, MemoryPair) {
        let (tx1, rx1) = mpsc::channel(64);
        let (tx2, rx2) = mpsc::channel(64);
        let a = (ChannelSink { tx: Some(tx1) }, ChannelSource { rx: rx2 }).into();
        let b = (ChannelSink { tx: Some(tx2) }, ChannelSource { rx: rx1 }).into();
        (a, b)
    }

    #[tokio::test]
    async fn loopback() {
        let (mut a, mut b) = memory_pair();
        a.send.send_frame(vec![1, 2, 3]).await.unwrap();
        assert_eq!(b.recv.next_frame().await.unwrap(), Some(vec![1, 2, 3]));
        a.send.close().await.unwrap();
        drop(a);
        assert_eq!(b.recv.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_after_peer_gone_is_transport_error() {
        let (mut a, b) = memory_pair();
        drop(b);
        assert!(matches!(
            a.send.send_frame(vec![0]).await,
            Err(Error::Transport(_))
        ));
    }
}
