//! Fixed ring of transaction slots correlating requests with their responses.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Instant;

use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::Arguments;

use super::QueryError;

/// Transaction ids are sent as 2 bytes.
pub const MAX_TRANSACTIONS_CAPACITY: usize = 1 << 16;

#[derive(Debug)]
struct Slot {
    /// Distinguishes successive occupants of the same slot.
    seq: u64,
    to: SocketAddrV4,
    sender: Sender<Arguments>,
}

/// A ring of `capacity` slots, each holding at most one waiting request.
///
/// Dropping a slot's [Sender] is how its waiter learns it was cancelled.
#[derive(Debug)]
pub struct Transactions {
    next_tid: usize,
    next_seq: u64,
    slots: Vec<Option<Slot>>,
}

impl Transactions {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_TRANSACTIONS_CAPACITY);

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            next_tid: 0,
            next_seq: 0,
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of requests still waiting for a response.
    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Advance the counter and install a fresh reply slot, cancelling any
    /// request still occupying it.
    pub fn allocate(&mut self, to: SocketAddrV4) -> (u16, u64, Receiver<Arguments>) {
        self.next_tid = (self.next_tid + 1) % self.slots.len();
        self.next_seq += 1;

        let tid = self.next_tid;

        if self.slots[tid].take().is_some() {
            debug!(
                context = "transactions",
                tid, "Transaction slot reused, cancelling the previous request"
            );
        }

        let (sender, receiver) = flume::bounded(1);
        self.slots[tid] = Some(Slot {
            seq: self.next_seq,
            to,
            sender,
        });

        (tid as u16, self.next_seq, receiver)
    }

    /// Deliver a response from `from` to the request waiting on `tid` and clear its slot.
    ///
    /// Returns `false` if nothing was waiting, for late, duplicate or unsolicited responses,
    /// and for responses from another address than the one the request was sent to.
    pub fn resolve(&mut self, tid: u16, from: SocketAddrV4, result: Arguments) -> bool {
        let Some(slot) = self.slots.get_mut(tid as usize) else {
            return false;
        };

        let Some(waiting) = slot.as_ref() else {
            return false;
        };

        if !compare_socket_addr(&waiting.to, &from) {
            trace!(
                context = "transactions",
                tid,
                ?from,
                "Response from wrong address"
            );
            return false;
        }

        slot.take()
            .map(|waiting| waiting.sender.send(result).is_ok())
            .unwrap_or(false)
    }

    /// Returns `true` if `tid` is a valid id for this ring.
    pub fn in_range(&self, tid: u16) -> bool {
        (tid as usize) < self.slots.len()
    }

    /// Clear the slot if it still belongs to the request `seq`.
    fn release(&mut self, tid: u16, seq: u64) {
        if let Some(slot) = self.slots.get_mut(tid as usize) {
            if slot.as_ref().map(|s| s.seq) == Some(seq) {
                *slot = None;
            }
        }
    }

    /// Cancel every waiting request.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

// Same as SocketAddr::eq but ignores the ip if it is unspecified for testing reasons.
fn compare_socket_addr(a: &SocketAddrV4, b: &SocketAddrV4) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}

/// Handle to an inflight request.
///
/// Dropping it abandons the request and frees its transaction slot.
#[derive(Debug)]
pub struct PendingQuery {
    tid: u16,
    seq: u64,
    receiver: Receiver<Arguments>,
    transactions: Arc<Mutex<Transactions>>,
}

impl PendingQuery {
    pub(crate) fn new(
        tid: u16,
        seq: u64,
        receiver: Receiver<Arguments>,
        transactions: Arc<Mutex<Transactions>>,
    ) -> Self {
        Self {
            tid,
            seq,
            receiver,
            transactions,
        }
    }

    /// The transaction id this request was sent with.
    pub fn transaction_id(&self) -> u16 {
        self.tid
    }

    /// Block until the response arrives, the request is cancelled, or `deadline` passes.
    pub fn wait(self, deadline: Instant) -> Result<Arguments, QueryError> {
        match self.receiver.recv_deadline(deadline) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => Err(QueryError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(QueryError::Cancelled),
        }
    }

    /// Returns the response if it already arrived, without blocking.
    pub fn try_wait(&self) -> Option<Result<Arguments, QueryError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(Ok(result)),
            Err(flume::TryRecvError::Empty) => None,
            Err(flume::TryRecvError::Disconnected) => Some(Err(QueryError::Cancelled)),
        }
    }

    /// Abandon this request.
    pub fn cancel(self) {}
}

impl Drop for PendingQuery {
    fn drop(&mut self) {
        self.transactions.lock().release(self.tid, self.seq);
    }
}
