//! Deferred reclamation for the fine-grained sequence.
//!
//! Removed nodes whose count reaches zero are pushed on a lock-free
//! free-list by the releasing thread; a dedicated worker drains it in two
//! passes separated by a grace interval and is the only place such nodes
//! are freed while the list is alive. Entries whose node turns out to be
//! referenced again are dropped from the list without touching the node.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use super::fine::{Node, Shared};
use super::State;

/// How long the worker sleeps when the free-list is empty.
const IDLE_INTERVAL: Duration = Duration::from_millis(50);

/// Grace interval between marking an entry in pass one and freeing it in
/// pass two.
const GRACE_INTERVAL: Duration = Duration::from_millis(5);

/// Multi-producer single-consumer stack of reclamation candidates.
/// Releasing threads push; only the worker and the final teardown pop.
pub(super) struct FreeQueue<T> {
    head: AtomicPtr<Entry<T>>,
}

struct Entry<T> {
    node: NonNull<Node<T>>,
    next: *mut Entry<T>,
}

impl<T> FreeQueue<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn push(&self, node: NonNull<Node<T>>) {
        let entry = Box::into_raw(Box::new(Entry {
            node,
            next: self.head.load(Ordering::Relaxed),
        }));
        unsafe {
            loop {
                let head = (*entry).next;
                match self
                    .head
                    .compare_exchange_weak(head, entry, Ordering::Release, Ordering::Relaxed)
                {
                    Ok(_) => return,
                    Err(current) => (*entry).next = current,
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Detach the whole chain. The worker calls this under the exclusive
    /// side of the latch.
    fn steal(&self) -> *mut Entry<T> {
        self.head.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    /// Free every queued entry and its node immediately, releasing the
    /// nodes' retained neighbour references; neighbours that reach zero
    /// are enqueued and drained in turn. Teardown only: the caller must be
    /// the sole remaining owner of the list.
    pub(super) unsafe fn drain(&self) {
        loop {
            let mut cur = self.steal();
            if cur.is_null() {
                return;
            }
            while !cur.is_null() {
                let entry = Box::from_raw(cur);
                cur = entry.next;
                let node = Box::from_raw(entry.node.as_ptr());
                for link in [
                    node.prev.load(Ordering::Relaxed),
                    node.next.load(Ordering::Relaxed),
                ]
                .iter()
                {
                    if let Some(neighbour) = NonNull::new(*link) {
                        if neighbour.as_ref().refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                            self.push(neighbour);
                        }
                    }
                }
            }
        }
    }
}

/// Reclamation worker loop.
///
/// Each round steals the free-list under the exclusive side of the latch,
/// re-checks and marks the candidates (pass one), waits out the grace
/// interval, then frees what is still unreferenced (pass two). Freeing a
/// node releases its retained neighbour references, which may enqueue the
/// neighbours in turn. The worker runs until the stop flag is set and the
/// free-list is fully drained.
pub(super) fn run<T>(shared: Arc<Shared<T>>, stop: Arc<AtomicBool>) {
    debug!("reclamation worker started");
    loop {
        let batch = {
            let _latch = shared.latch.write();
            shared.queue.steal()
        };

        if batch.is_null() {
            if stop.load(Ordering::Acquire) && shared.queue.is_empty() {
                break;
            }
            thread::sleep(IDLE_INTERVAL);
            continue;
        }

        // pass one: re-check candidacy and mark the survivors
        let mut pending = Vec::new();
        let mut dropped = 0;
        unsafe {
            let mut cur = batch;
            while !cur.is_null() {
                let entry = Box::from_raw(cur);
                cur = entry.next;
                let node = entry.node.as_ref();
                if node.refs.load(Ordering::Acquire) != 0 || node.already.load(Ordering::Acquire) {
                    // reachable again through a pending cursor, or seen
                    // once already
                    dropped += 1;
                    continue;
                }
                node.already.store(true, Ordering::Release);
                pending.push(entry.node);
            }
        }
        if dropped > 0 {
            trace!(dropped, "dropped stale free-list entries");
        }
        if pending.is_empty() {
            continue;
        }

        thread::sleep(GRACE_INTERVAL);

        // pass two: free what is still unreferenced
        let mut freed = 0;
        unsafe {
            for node in pending {
                if node.as_ref().refs.load(Ordering::Acquire) != 0 {
                    // resurrected during the grace interval; unmark so a
                    // later pass can reconsider it
                    node.as_ref().already.store(false, Ordering::Release);
                    continue;
                }
                debug_assert_eq!(node.as_ref().state(), State::Removed);
                let boxed = Box::from_raw(node.as_ptr());
                for link in [
                    boxed.prev.load(Ordering::Relaxed),
                    boxed.next.load(Ordering::Relaxed),
                ]
                .iter()
                {
                    if let Some(neighbour) = NonNull::new(*link) {
                        shared.release(neighbour);
                    }
                }
                freed += 1;
            }
        }
        trace!(freed, "reclaimed removed nodes");
    }
    debug!("reclamation worker stopped");
}

#[cfg(test)]
mod tests {
    use std::ptr;
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize};
    use std::sync::Arc;
    use std::thread;

    use parking_lot::RwLock;

    use super::super::fine::Node;
    use super::super::State;
    use super::FreeQueue;

    fn orphan_node() -> NonNull<Node<i32>> {
        NonNull::from(Box::leak(Box::new(Node {
            value: RwLock::new(None),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(State::Removed as u8),
            already: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
        })))
    }

    #[test]
    fn pushes_come_back_out_of_a_steal() {
        let queue = FreeQueue::new();
        for _ in 0..3 {
            queue.push(orphan_node());
        }

        let mut count = 0;
        let mut cur = queue.steal();
        while !cur.is_null() {
            let entry = unsafe { Box::from_raw(cur) };
            cur = entry.next;
            unsafe { drop(Box::from_raw(entry.node.as_ptr())) };
            count += 1;
        }

        assert_eq!(count, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = Arc::new(FreeQueue::new());

        let producers: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for _ in 0..100 {
                        queue.push(orphan_node());
                    }
                })
            })
            .collect();
        for t in producers {
            t.join().unwrap();
        }

        let mut count = 0;
        let mut cur = queue.steal();
        while !cur.is_null() {
            let entry = unsafe { Box::from_raw(cur) };
            cur = entry.next;
            unsafe { drop(Box::from_raw(entry.node.as_ptr())) };
            count += 1;
        }
        assert_eq!(count, 800);
    }
}
