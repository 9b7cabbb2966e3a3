// (c) 2025 Ross Younger

//! Request/response correlation
//!
//! SMP is full-duplex: requests go out, responses come back in whatever
//! order the device feels like, and occasionally a frame arrives that nobody
//! asked for. The [`Router`] holds the table of outstanding requests keyed
//! by `(group, id, sequence)`, hands each inbound frame to the caller that
//! is waiting for it, and fails everything at once when the link dies.
//!
//! The sequence space is 8 bits, so at most 256 requests can be in flight;
//! the counter skips over sequence numbers still owned by pending entries
//! when it wraps.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, Weak};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::ClientInner;
use crate::protocol::{SmpFrame, SmpHeader};
use crate::transport::FrameSource;
use crate::{Error, Result};

/// Hard cap on concurrently outstanding requests, set by the sequence width
const MAX_IN_FLIGHT: usize = 256;

type PendingKey = (u16, u8, u8); // group, id, sequence

struct PendingEntry {
    token: u64,
    tx: oneshot::Sender<Result<SmpFrame>>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<PendingKey, PendingEntry>,
    next_seq: u8,
    next_token: u64,
    /// Set once the client can no longer serve requests; subsequent
    /// registrations fail immediately with this reason.
    fatal: Option<Error>,
}

/// The pending-request table plus sequence allocation
#[derive(Default)]
pub(crate) struct Router {
    table: Mutex<PendingTable>,
}

/// Removes the pending entry on drop, unless a response already claimed it.
///
/// This is what makes cancellation safe: a caller that gives up waiting
/// (timeout, future dropped) releases its table slot, and a late response
/// for that slot is then just another unmatched frame.
pub(crate) struct Reservation<'a> {
    router: &'a Router,
    key: PendingKey,
    token: u64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut table = self.router.lock();
        if table
            .entries
            .get(&self.key)
            .is_some_and(|e| e.token == self.token)
        {
            let _ = table.entries.remove(&self.key);
        }
    }
}

impl Router {
    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().expect("pending table poisoned")
    }

    /// Assigns the next free sequence number to `header` and registers
    /// interest in the matching response.
    pub(crate) fn register(
        &self,
        header: &mut SmpHeader,
    ) -> Result<(Reservation<'_>, oneshot::Receiver<Result<SmpFrame>>)> {
        let mut table = self.lock();
        if let Some(reason) = &table.fatal {
            return Err(reason.clone());
        }
        if table.entries.len() >= MAX_IN_FLIGHT {
            return Err(Error::Overloaded);
        }
        let mut seq = table.next_seq;
        while table.entries.keys().any(|k| k.2 == seq) {
            seq = seq.wrapping_add(1);
        }
        table.next_seq = seq.wrapping_add(1);
        header.sequence = seq;

        let key = (header.group, header.id, seq);
        let token = table.next_token;
        table.next_token += 1;
        let (tx, rx) = oneshot::channel();
        let _ = table.entries.insert(key, PendingEntry { token, tx });
        Ok((
            Reservation {
                router: self,
                key,
                token,
            },
            rx,
        ))
    }

    /// Routes one inbound frame to whoever is waiting for it.
    ///
    /// Frames with no pending entry are not an error (devices emit
    /// unsolicited notifications), so they are merely logged and dropped.
    fn dispatch(&self, frame: SmpFrame) {
        let key = (frame.header.group, frame.header.id, frame.header.sequence);
        let entry = self.lock().entries.remove(&key);
        match entry {
            Some(PendingEntry { tx, .. }) => {
                // The caller may have given up in the meantime; that's fine.
                let _ = tx.send(Ok(frame));
            }
            None => debug!("discarding unmatched frame: {frame}"),
        }
    }

    /// Fails every pending request and all future ones with `reason`.
    /// The first reason recorded wins.
    pub(crate) fn fail_all(&self, reason: Error) {
        let mut table = self.lock();
        if table.fatal.is_none() {
            table.fatal = Some(reason.clone());
        }
        for (_, entry) in table.entries.drain() {
            let _ = entry.tx.send(Err(reason.clone()));
        }
    }

    /// Number of outstanding requests
    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.lock().entries.len()
    }
}


/// The receive loop. Owns the transport's frame source exclusively; runs
/// until the stream ends, the transport fails, or the client is dropped.
///
/// Holds only a weak reference to the client so that dropping the last
/// [`SmpClient`](super::SmpClient) clone does not leak the loop's state.
pub(crate) async fn run_receiver<R: FrameSource>(mut source: R, client: Weak<ClientInner>) {
    loop {
        let event = source.next_frame().await;
        let Some(client) = client.upgrade() else {
            return;
        };
        match event {
            Ok(Some(raw)) => match SmpFrame::decode(&raw) {
                Ok(frame) => {
                    trace!("recv {frame}");
                    client.router.dispatch(frame);
                }
                Err(e) => debug!("discarding undecodable {}-byte frame: {e}", raw.len()),
            },
            Ok(None) => {
                debug!("frame stream ended");
                client.router.fail_all(Error::link_lost("frame stream ended"));
                return;
            }
            Err(e) => {
                debug!("receive failed: {e}");
                client.router.fail_all(e);
                return;
            }
        }
    }
}
