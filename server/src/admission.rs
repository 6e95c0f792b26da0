//! Per-worker admission control for in-flight I/O operations.
//!
//! Each worker budgets how many read/write operations may be outstanding
//! against the OS at once. Requests over the ceiling are parked on FIFO
//! queues rather than failed or dropped; every completed operation hands
//! its slot to a parked request, draining writes ahead of reads because
//! writes are the more likely to finish without immediately blocking
//! again.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Which kind of operation a slot is being requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

#[derive(Default)]
struct Inner {
    in_flight: u32,
    reads: VecDeque<oneshot::Sender<()>>,
    writes: VecDeque<oneshot::Sender<()>>,
}

/// Bounded-concurrency gate. A limit of 0 means unconstrained: both
/// `acquire` and `complete` become no-ops and the OS is the only brake.
pub struct Admission {
    limit: u32,
    inner: Mutex<Inner>,
}

impl Admission {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Waits for an operation slot. Returns immediately while the worker
    /// is under its ceiling; otherwise parks FIFO until a completing
    /// operation hands over its slot.
    pub async fn acquire(&self, op: Op) {
        if self.limit == 0 {
            return;
        }

        let ticket = {
            let mut inner = self.inner.lock().unwrap();
            if inner.in_flight < self.limit {
                inner.in_flight += 1;
                return;
            }
            let (tx, rx) = oneshot::channel();
            match op {
                Op::Read => inner.reads.push_back(tx),
                Op::Write => inner.writes.push_back(tx),
            }
            rx
        };

        // A dropped gate releases the waiter; the caller re-checks its
        // closing flag on the next step either way.
        let _ = ticket.await;
    }

    /// Releases the slot of a finished operation. The slot goes to a
    /// parked request if any are waiting (writes first); abandoned waiters
    /// are skipped until one accepts or both queues are empty, and only
    /// then does the in-flight count actually drop.
    pub fn complete(&self) {
        if self.limit == 0 {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        loop {
            let next = match inner.writes.pop_front() {
                Some(tx) => Some(tx),
                None => inner.reads.pop_front(),
            };
            match next {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        // handed over: one op out, one op in, count unchanged
                        return;
                    }
                }
                None => {
                    inner.in_flight = inner
                        .in_flight
                        .checked_sub(1)
                        .expect("operation completed without a matching start");
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> u32 {
        self.inner.lock().unwrap().in_flight
    }

    #[cfg(test)]
    fn queued(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.reads.len(), inner.writes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready};

    #[test]
    fn test_unlimited_gate_never_blocks() {
        let gate = Admission::new(0);
        for _ in 0..100 {
            let mut fut = task::spawn(gate.acquire(Op::Read));
            assert_ready!(fut.poll());
        }
        gate.complete();
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_ceiling_admits_k_and_queues_the_rest() {
        let gate = Admission::new(3);

        let mut parked = Vec::new();
        for i in 0..8 {
            let mut fut = task::spawn(gate.acquire(Op::Read));
            if i < 3 {
                assert_ready!(fut.poll());
            } else {
                assert_pending!(fut.poll());
                parked.push(fut);
            }
        }
        assert_eq!(gate.in_flight(), 3);
        assert_eq!(gate.queued(), (5, 0));

        // each completion admits exactly one parked request
        for admitted in 0..parked.len() {
            gate.complete();
            assert_ready!(parked[admitted].poll());
            assert_eq!(gate.in_flight(), 3);
            assert_eq!(gate.queued().0, 5 - admitted - 1);
        }

        // draining the survivors frees budget for real
        for expected in (0..3).rev() {
            gate.complete();
            assert_eq!(gate.in_flight(), expected);
        }
    }

    #[test]
    fn test_writes_admitted_before_reads() {
        let gate = Admission::new(1);

        let mut holder = task::spawn(gate.acquire(Op::Read));
        assert_ready!(holder.poll());

        let mut read = task::spawn(gate.acquire(Op::Read));
        assert_pending!(read.poll());
        let mut write = task::spawn(gate.acquire(Op::Write));
        assert_pending!(write.poll());

        // the read was queued first, but the write goes out first
        gate.complete();
        assert_ready!(write.poll());
        assert_pending!(read.poll());

        gate.complete();
        assert_ready!(read.poll());
    }

    #[test]
    fn test_abandoned_waiter_does_not_eat_the_slot() {
        let gate = Admission::new(1);

        let mut holder = task::spawn(gate.acquire(Op::Write));
        assert_ready!(holder.poll());

        let mut gone = task::spawn(gate.acquire(Op::Write));
        assert_pending!(gone.poll());
        let mut alive = task::spawn(gate.acquire(Op::Write));
        assert_pending!(alive.poll());

        drop(gone);
        gate.complete();
        assert_ready!(alive.poll());
        assert_eq!(gate.in_flight(), 1);
    }

    #[test]
    fn test_complete_with_empty_queues_frees_budget() {
        let gate = Admission::new(2);
        let mut a = task::spawn(gate.acquire(Op::Read));
        assert_ready!(a.poll());
        let mut b = task::spawn(gate.acquire(Op::Write));
        assert_ready!(b.poll());
        assert_eq!(gate.in_flight(), 2);

        gate.complete();
        gate.complete();
        assert_eq!(gate.in_flight(), 0);

        let mut c = task::spawn(gate.acquire(Op::Read));
        assert_ready!(c.poll());
    }
}
