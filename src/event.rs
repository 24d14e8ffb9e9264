//! The global callback queue (spec §1 external collaborator; spec §5
//! concurrency model). Dispatches callbacks in non-decreasing cycle order,
//! ties broken by insertion order — the same shape as `shadow-shadow`'s
//! `EventQueue`/`PanickingOrd<Event>` (`src/main/core/work/event_queue.rs`),
//! adapted here to own `Box<dyn FnOnce(&mut A, &mut B)>` callbacks generic
//! over the coordinator type `A` and the pipeline-host collaborator `B`,
//! since AppMgr's own callbacks (swap-in/out completions, migrate rechecks)
//! need to mutate both.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::time::Cycle;

pub type Callback<A, B> = Box<dyn FnOnce(&mut A, &mut B)>;

/// Monotonically increasing identity used to break ties in insertion order
/// and to let [`CallbackHandle`] cancellation find (and invalidate) the
/// right entry without needing `PartialEq` on the boxed closure.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CallbackId(u64);

struct Entry<A, B> {
    cyc: Cycle,
    id: CallbackId,
    cb: Option<Callback<A, B>>,
}

impl<A, B> PartialEq for Entry<A, B> {
    fn eq(&self, other: &Self) -> bool {
        self.cyc == other.cyc && self.id == other.id
    }
}
impl<A, B> Eq for Entry<A, B> {}

impl<A, B> PartialOrd for Entry<A, B> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A, B> Ord for Entry<A, B> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ties broken by insertion order (lower id = earlier insertion).
        self.cyc.cmp(&other.cyc).then(self.id.cmp(&other.id))
    }
}

/// A non-owning reference to a queued callback. The queue itself owns the
/// callback (matching spec §4.6: "the coordinator never stores raw
/// references to callback objects after enqueuing them"); this handle only
/// identifies which entry to cancel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CallbackHandle(CallbackId);

pub struct EventQueue<A, B> {
    heap: BinaryHeap<Reverse<Entry<A, B>>>,
    next_id: u64,
    last_popped: Option<Cycle>,
}

impl<A, B> EventQueue<A, B> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_id: 0,
            last_popped: None,
        }
    }

    pub fn enqueue(&mut self, cyc: Cycle, cb: Callback<A, B>) -> CallbackHandle {
        if let Some(last) = self.last_popped {
            assert!(cyc >= last, "enqueued callback at {cyc} before last dispatch at {last}");
        }
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse(Entry { cyc, id, cb: Some(cb) }));
        CallbackHandle(id)
    }

    /// Marks the callback identified by `handle` as cancelled. If it has
    /// already been popped and invoked, this is a no-op (spec §4.6:
    /// cancelling a fired callback is harmless).
    pub fn cancel(&mut self, handle: CallbackHandle) {
        for Reverse(entry) in self.heap.iter_mut() {
            if entry.id == handle.0 {
                entry.cb = None;
                return;
            }
        }
    }

    /// Pops and returns the next due callback, if any, asserting
    /// non-decreasing dispatch order.
    pub fn pop(&mut self) -> Option<(Cycle, Callback<A, B>)> {
        while let Some(Reverse(mut entry)) = self.heap.pop() {
            if let Some(last) = self.last_popped {
                assert!(entry.cyc >= last, "event queue dispatched out of order");
            }
            self.last_popped = Some(entry.cyc);
            if let Some(cb) = entry.cb.take() {
                return Some((entry.cyc, cb));
            }
            // cancelled entry; keep draining
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.heap.iter().all(|Reverse(e)| e.cb.is_none())
    }

    /// The cycle of the next (possibly cancelled) entry, without popping it.
    pub fn peek_cycle(&self) -> Option<Cycle> {
        self.heap.peek().map(|Reverse(e)| e.cyc)
    }
}

impl<A, B> Default for EventQueue<A, B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_in_nondecreasing_cycle_order_ties_by_insertion() {
        let mut q: EventQueue<Vec<i32>, ()> = EventQueue::new();
        q.enqueue(Cycle(5), Box::new(|v, _| v.push(5)));
        q.enqueue(Cycle(1), Box::new(|v, _| v.push(1)));
        q.enqueue(Cycle(1), Box::new(|v, _| v.push(2)));

        let mut state = Vec::new();
        let mut host = ();
        while let Some((_, cb)) = q.pop() {
            cb(&mut state, &mut host);
        }
        assert_eq!(state, vec![1, 2, 5]);
    }

    #[test]
    fn cancel_prevents_dispatch() {
        let mut q: EventQueue<Vec<i32>, ()> = EventQueue::new();
        let h = q.enqueue(Cycle(1), Box::new(|v, _| v.push(1)));
        q.cancel(h);
        let mut state = Vec::new();
        let mut host = ();
        while let Some((_, cb)) = q.pop() {
            cb(&mut state, &mut host);
        }
        assert!(state.is_empty());
    }
}
