//! Fine-grained sequence: a readers/writer lock per node, splices that
//! validate the neighbourhood after locking and retry when it changed, and
//! a background worker that reclaims removed nodes.
//!
//! Locking discipline: locks are always taken in list order, prev before
//! self before next. The per-node lock guards the value and the right to
//! rewrite the links around the node; the links themselves are atomic, so
//! a cursor hop may read either the pre- or the post-splice neighbour.
//! Both are correct outcomes.
//!
//! Lifetime discipline: an increment is only performed on a node reached
//! through a pinned one (or through a locked sentinel), and any node
//! reachable that way still carries the pinning node's retained reference,
//! so its count is non-zero and the reclaimer will not free it. Decrements
//! go through [`Shared::release`], under the shared side of the latch whose
//! exclusive side serialises the reclaimer's sampling of the free-list.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::RwLock;
use tracing::trace;

use super::reclaim::{self, FreeQueue};
use super::State;
use crate::{Error, Result};

/// List node. The value lock doubles as the per-node lock of the splice
/// discipline.
pub(super) struct Node<T> {
    /// Element payload. `None` only on the two sentinels.
    pub value: RwLock<Option<T>>,

    pub prev: AtomicPtr<Node<T>>,
    pub next: AtomicPtr<Node<T>>,

    pub state: AtomicU8,
    /// Reclaimer mark: survived pass one, freed in pass two.
    pub already: AtomicBool,
    pub refs: AtomicUsize,
}

impl<T> Node<T> {
    fn alloc(value: T) -> NonNull<Self> {
        NonNull::from(Box::leak(Box::new(Self {
            value: RwLock::new(Some(value)),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(State::Valid as u8),
            already: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
        })))
    }

    /// The count starts at one for the container's own handle, which keeps
    /// sentinels off the free-list for good.
    fn sentinel(state: State) -> NonNull<Self> {
        NonNull::from(Box::leak(Box::new(Self {
            value: RwLock::new(None),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(state as u8),
            already: AtomicBool::new(false),
            refs: AtomicUsize::new(1),
        })))
    }

    pub(super) fn state(&self) -> State {
        State::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(super) fn next_node(&self) -> Option<NonNull<Node<T>>> {
        NonNull::new(self.next.load(Ordering::Acquire))
    }

    pub(super) fn prev_node(&self) -> Option<NonNull<Node<T>>> {
        NonNull::new(self.prev.load(Ordering::Acquire))
    }

    fn pin(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }
}

/// List internals shared by the container, its cursors, and the
/// reclamation worker.
pub(super) struct Shared<T> {
    pub head: NonNull<Node<T>>,
    pub tail: NonNull<Node<T>>,
    pub len: AtomicUsize,
    /// Mutator/reclaimer latch: releases take the shared side around their
    /// decrement, the reclaimer takes the exclusive side between sampling
    /// the free-list head and splicing it out.
    pub latch: RwLock<()>,
    pub queue: FreeQueue<T>,
}

unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn new() -> Self {
        let head = Node::sentinel(State::Begin);
        let tail = Node::sentinel(State::End);
        unsafe {
            head.as_ref().next.store(tail.as_ptr(), Ordering::Release);
            tail.as_ref().pin();
            tail.as_ref().prev.store(head.as_ptr(), Ordering::Release);
            head.as_ref().pin();
        }
        Self {
            head,
            tail,
            len: AtomicUsize::new(0),
            latch: RwLock::new(()),
            queue: FreeQueue::new(),
        }
    }

    /// Drop one reference under the shared side of the latch. A node that
    /// reaches zero is handed to the reclaimer instead of being freed on
    /// the releasing thread.
    pub(super) fn release(&self, node: NonNull<Node<T>>) {
        let _lease = self.latch.read();
        unsafe {
            if node.as_ref().refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.queue.push(node);
            }
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // Teardown ignores reference counts: the worker is joined and no
        // cursor can be alive here. Free whatever releases enqueued after
        // the worker exited, then walk the ring.
        unsafe {
            self.queue.drain();
            let mut cur = Some(self.head);
            while let Some(node) = cur {
                let next = NonNull::new(node.as_ref().next.load(Ordering::Relaxed));
                drop(Box::from_raw(node.as_ptr()));
                cur = next;
            }
        }
    }
}

/// Doubly-linked sequence with per-node locks and deferred reclamation.
///
/// Mutators serialise on the smallest enclosing lock set (prev, self,
/// next); a dedicated worker thread frees removed nodes once no reference
/// to them remains, so no thread ever frees a node another thread is
/// traversing.
pub struct FineList<T> {
    shared: Arc<Shared<T>>,
    stop: Arc<AtomicBool>,
    reclaimer: Option<JoinHandle<()>>,
}

impl<T> FineList<T>
where
    T: Send + Sync + 'static,
{
    pub fn new() -> Self {
        let shared = Arc::new(Shared::new());
        let stop = Arc::new(AtomicBool::new(false));
        let reclaimer = {
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("list-reclaimer".into())
                .spawn(move || reclaim::run(shared, stop))
                .expect("spawn reclaimer thread")
        };
        Self {
            shared,
            stop,
            reclaimer: Some(reclaimer),
        }
    }

    pub fn push_front(&self, value: T) {
        unsafe {
            let head = self.shared.head;
            let _g_head = head.as_ref().value.write();
            // the first node cannot be unlinked while the head sentinel,
            // its prev, is write-locked
            let right = head.as_ref().next_node().unwrap();
            let _g_right = right.as_ref().value.write();

            let node = Node::alloc(value);
            link_between(node, head, right);
            self.shared.len.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn push_back(&self, value: T) {
        unsafe {
            let tail = self.shared.tail;
            let node = Node::alloc(value);
            loop {
                let left = {
                    let _g = tail.as_ref().value.write();
                    let left = tail.as_ref().prev_node().unwrap();
                    left.as_ref().pin();
                    left
                };

                let spliced = {
                    let _g_left = left.as_ref().value.write();
                    let _g_tail = tail.as_ref().value.write();
                    if left.as_ref().next.load(Ordering::Acquire) == tail.as_ptr()
                        && tail.as_ref().prev.load(Ordering::Acquire) == left.as_ptr()
                    {
                        link_between(node, left, tail);
                        self.shared.len.fetch_add(1, Ordering::Relaxed);
                        true
                    } else {
                        // the neighbourhood changed between lookup and
                        // lock acquisition
                        false
                    }
                };
                self.shared.release(left);
                if spliced {
                    return;
                }
            }
        }
    }

    /// Insert `value` after the cursor position. A no-op when the cursor
    /// points at a removed node; the boundary sentinels append at the
    /// matching end.
    pub fn insert(&self, it: &Cursor<T>, value: T) {
        debug_assert!(Arc::ptr_eq(&self.shared, &it.shared));
        unsafe {
            let node = it.node;
            match node.as_ref().state() {
                State::End => self.push_back(value),
                State::Begin => self.push_front(value),
                State::Valid | State::Removed => {
                    let _g_node = node.as_ref().value.write();
                    if node.as_ref().state() == State::Removed {
                        return;
                    }
                    let right = node.as_ref().next_node().unwrap();
                    let _g_right = right.as_ref().value.write();

                    let fresh = Node::alloc(value);
                    link_between(fresh, node, right);
                    self.shared.len.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Remove the element under the cursor. A no-op on sentinels and on
    /// nodes already removed; the cursor keeps the node readable until it
    /// moves on.
    pub fn erase(&self, it: &Cursor<T>) {
        debug_assert!(Arc::ptr_eq(&self.shared, &it.shared));
        let node = it.node;
        unsafe {
            if node.as_ref().state() != State::Valid {
                return;
            }
            loop {
                let (left, right) = {
                    let _g = node.as_ref().value.read();
                    if node.as_ref().state() == State::Removed {
                        return;
                    }
                    // pin the neighbourhood before giving up the lock
                    let left = node.as_ref().prev_node().unwrap();
                    let right = node.as_ref().next_node().unwrap();
                    left.as_ref().pin();
                    right.as_ref().pin();
                    (left, right)
                };

                let unlinked = {
                    let _g_left = left.as_ref().value.write();
                    let _g_node = node.as_ref().value.read();
                    let _g_right = right.as_ref().value.write();

                    // a neighbour removed since the pin still aims its
                    // frozen pointer at this node, so the pointer checks
                    // alone would accept a stale neighbourhood
                    if left.as_ref().state() != State::Removed
                        && right.as_ref().state() != State::Removed
                        && left.as_ref().next.load(Ordering::Acquire) == node.as_ptr()
                        && right.as_ref().prev.load(Ordering::Acquire) == node.as_ptr()
                    {
                        node.as_ref().set_state(State::Removed);
                        // the node loses both incoming pointers but keeps
                        // its own, which now pin the neighbours
                        node.as_ref().refs.fetch_sub(2, Ordering::AcqRel);
                        left.as_ref().next.store(right.as_ptr(), Ordering::Release);
                        right.as_ref().prev.store(left.as_ptr(), Ordering::Release);
                        left.as_ref().pin();
                        right.as_ref().pin();
                        self.shared.len.fetch_sub(1, Ordering::Relaxed);
                        true
                    } else {
                        false
                    }
                };
                self.shared.release(left);
                self.shared.release(right);
                if unlinked {
                    trace!("unlinked node handed over to outstanding references");
                    return;
                }
            }
        }
    }

    /// Remove the last element, if any.
    pub fn pop_back(&self) {
        unsafe {
            let last = {
                let _g = self.shared.tail.as_ref().value.read();
                let last = self.shared.tail.as_ref().prev_node().unwrap();
                if last == self.shared.head {
                    return;
                }
                last.as_ref().pin();
                last
            };
            let it = Cursor {
                shared: Arc::clone(&self.shared),
                node: last,
            };
            self.erase(&it);
        }
    }

    /// Cursor to the first element holding `value`, or `end()`.
    pub fn find(&self, value: &T) -> Cursor<T>
    where
        T: PartialEq,
    {
        let mut cur = self.begin();
        loop {
            if cur.is_end() {
                return cur;
            }
            unsafe {
                let guard = cur.node.as_ref().value.read();
                if guard.as_ref() == Some(value) {
                    drop(guard);
                    return cur;
                }
            }
            cur.advance();
        }
    }

    pub fn size(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Cursor pinned to the first element; equals `end()` when empty.
    pub fn begin(&self) -> Cursor<T> {
        unsafe {
            let head = self.shared.head;
            // under the head's lock its successor cannot be unlinked, so
            // the pin is taken on a live node
            let _g = head.as_ref().value.read();
            let first = head.as_ref().next_node().unwrap();
            first.as_ref().pin();
            Cursor {
                shared: Arc::clone(&self.shared),
                node: first,
            }
        }
    }

    /// Cursor parked on the end sentinel.
    pub fn end(&self) -> Cursor<T> {
        unsafe {
            self.shared.tail.as_ref().pin();
        }
        Cursor {
            shared: Arc::clone(&self.shared),
            node: self.shared.tail,
        }
    }
}

impl<T> Default for FineList<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::iter::FromIterator<T> for FineList<T>
where
    T: Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let list = Self::new();
        for value in iter {
            list.push_back(value);
        }
        list
    }
}

impl<T> Drop for FineList<T> {
    fn drop(&mut self) {
        // the worker drains the free-list to zero before exiting
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.reclaimer.take() {
            let _ = worker.join();
        }
    }
}

/// Wire a fresh node between two locked neighbours. The new node gains its
/// two incoming pointers; the neighbours trade each other's pointer for
/// one of the new node's, so their counts are unchanged.
unsafe fn link_between<T>(node: NonNull<Node<T>>, left: NonNull<Node<T>>, right: NonNull<Node<T>>) {
    node.as_ref().prev.store(left.as_ptr(), Ordering::Release);
    node.as_ref().next.store(right.as_ptr(), Ordering::Release);
    node.as_ref().refs.store(2, Ordering::Relaxed);
    left.as_ref().next.store(node.as_ptr(), Ordering::Release);
    right.as_ref().prev.store(node.as_ptr(), Ordering::Release);
}

/// Pinned position inside a [`FineList`].
///
/// The cursor owns one reference to its node; advancement takes a shared
/// lease on the reclamation latch for the duration of a single hop, so the
/// node it moves onto cannot be freed out from under it.
pub struct Cursor<T> {
    shared: Arc<Shared<T>>,
    node: NonNull<Node<T>>,
}

unsafe impl<T: Send + Sync> Send for Cursor<T> {}
unsafe impl<T: Send + Sync> Sync for Cursor<T> {}

impl<T> Cursor<T> {
    /// Whether the cursor is parked on the end sentinel.
    pub fn is_end(&self) -> bool {
        self.node == self.shared.tail
    }

    /// Read the element under the cursor. Removed nodes stay readable;
    /// only the sentinels are not.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        unsafe {
            let guard = self.node.as_ref().value.read();
            guard.clone().ok_or(Error::InvalidCursor)
        }
    }

    /// Overwrite the element under the node's writer lease.
    pub fn set(&self, value: T) -> Result<()> {
        unsafe {
            let mut guard = self.node.as_ref().value.write();
            match &mut *guard {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(Error::InvalidCursor),
            }
        }
    }

    /// Hop to the next node; stays put on the end sentinel. A removed
    /// node's retained next pointer still leads back into the list.
    pub fn advance(&mut self) {
        unsafe {
            if self.node.as_ref().state() == State::End {
                return;
            }
            let next = {
                let _lease = self.shared.latch.read();
                let next = self.node.as_ref().next_node().unwrap();
                next.as_ref().pin();
                next
            };
            let old = self.node;
            self.node = next;
            self.shared.release(old);
        }
    }

    /// Hop to the previous node; stays put on the begin sentinel.
    pub fn retreat(&mut self) {
        unsafe {
            if self.node.as_ref().state() == State::Begin {
                return;
            }
            let prev = {
                let _lease = self.shared.latch.read();
                let prev = self.node.as_ref().prev_node().unwrap();
                prev.as_ref().pin();
                prev
            };
            let old = self.node;
            self.node = prev;
            self.shared.release(old);
        }
    }
}

impl<T> Clone for Cursor<T> {
    fn clone(&self) -> Self {
        // the source cursor already pins the node, so the count cannot
        // reach zero while we take the clone's reference
        unsafe { self.node.as_ref().pin() };
        Self {
            shared: Arc::clone(&self.shared),
            node: self.node,
        }
    }
}

impl<T> PartialEq for Cursor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl<T> Eq for Cursor<T> {}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        self.shared.release(self.node);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use rand::Rng;

    use super::FineList;
    use crate::Error;

    fn collect(list: &FineList<i32>) -> Vec<i32> {
        let mut out = Vec::new();
        let mut cur = list.begin();
        while !cur.is_end() {
            out.push(cur.get().unwrap());
            cur.advance();
        }
        out
    }

    #[test]
    fn pushes_keep_order() {
        let list = FineList::new();
        list.push_back(2);
        list.push_back(3);
        list.push_front(1);

        assert_eq!(collect(&list), vec![1, 2, 3]);
        assert_eq!(list.size(), 3);
    }

    #[test]
    fn insert_after_cursor() {
        let list: FineList<i32> = [1, 3].iter().copied().collect();

        let it = list.find(&1);
        list.insert(&it, 2);
        drop(it);

        assert_eq!(collect(&list), vec![1, 2, 3]);
    }

    #[test]
    fn erase_through_a_cursor() {
        let list: FineList<i32> = [1, 2, 3].iter().copied().collect();

        let it = list.find(&2);
        list.erase(&it);
        list.erase(&it);
        drop(it);

        assert_eq!(collect(&list), vec![1, 3]);
        assert_eq!(list.size(), 2);
    }

    #[test]
    fn cursor_survives_erase() {
        let list: FineList<i32> = [1, 2, 3].iter().copied().collect();

        let mut it = list.find(&2);
        list.erase(&it);

        // the removed node stays readable through the cursor
        assert_eq!(it.get(), Ok(2));

        it.advance();
        assert_eq!(it.get(), Ok(3));
        it.retreat();
        assert_eq!(it.get(), Ok(1));
    }

    #[test]
    fn set_overwrites_in_place() {
        let list: FineList<i32> = [7].iter().copied().collect();

        let it = list.find(&7);
        assert_eq!(it.set(8), Ok(()));
        assert_eq!(it.get(), Ok(8));

        assert_eq!(list.end().set(1), Err(Error::InvalidCursor));
        assert_eq!(list.end().get(), Err(Error::InvalidCursor));
    }

    #[test]
    fn pop_back_drops_the_last_element() {
        let list: FineList<i32> = [1, 2].iter().copied().collect();

        list.pop_back();
        assert_eq!(collect(&list), vec![1]);

        list.pop_back();
        list.pop_back();
        assert!(list.is_empty());
    }

    #[test]
    fn find_misses_return_end() {
        let list: FineList<i32> = [1, 2].iter().copied().collect();

        assert!(list.find(&9).is_end());
        assert_eq!(list.find(&2).get(), Ok(2));
    }

    #[test]
    fn cursor_outlives_the_list_handle() {
        let list: FineList<i32> = [1, 2].iter().copied().collect();
        let mut it = list.begin();
        drop(list);

        assert_eq!(it.get(), Ok(1));
        it.advance();
        assert_eq!(it.get(), Ok(2));
    }

    #[test]
    fn concurrent_push_back_keeps_every_value() {
        let list = Arc::new(FineList::new());

        let writers: Vec<_> = (0..8)
            .map(|t| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for j in 0..1000 {
                        list.push_back(t * 1000 + j);
                    }
                })
            })
            .collect();
        for t in writers {
            t.join().unwrap();
        }

        assert_eq!(list.size(), 8000);
        let mut values = collect(&list);
        values.sort_unstable();
        assert_eq!(values, (0..8000).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_push_then_erase() {
        let list = Arc::new(FineList::new());

        let writers: Vec<_> = (0..8)
            .map(|t| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for j in 0..1000 {
                        list.push_back(t * 1000 + j);
                    }
                })
            })
            .collect();
        for t in writers {
            t.join().unwrap();
        }

        let erasers: Vec<_> = (0..8)
            .map(|t| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for j in 0..100 {
                        let it = list.find(&(t * 100 + j));
                        list.erase(&it);
                    }
                })
            })
            .collect();
        for t in erasers {
            t.join().unwrap();
        }

        assert!(list.size() >= 7200);
        let remaining = collect(&list);
        assert!(remaining.iter().all(|v| (0..8000).contains(v)));
    }

    #[test]
    fn iteration_survives_concurrent_head_erasure() {
        let n = 2000;
        let list: Arc<FineList<i32>> = Arc::new((0..n).collect());

        let erasers: Vec<_> = (0..4)
            .map(|_| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for _ in 0..(n / 8) {
                        let it = list.begin();
                        list.erase(&it);
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let offset = rng.gen_range(0..n);
                    let mut cur = list.begin();
                    for _ in 0..offset {
                        if cur.is_end() {
                            break;
                        }
                        cur.advance();
                    }
                })
            })
            .collect();

        for t in erasers.into_iter().chain(readers) {
            t.join().unwrap();
        }
        assert!(list.size() >= (n / 2) as usize);
    }

    #[test]
    fn removed_nodes_are_reclaimed_in_the_background() {
        let list: Arc<FineList<i32>> = Arc::new((0..64).collect());

        for v in 0..64 {
            let it = list.find(&v);
            list.erase(&it);
        }
        assert!(list.is_empty());

        // give the worker a couple of rounds to drain the free-list, then
        // keep using the list
        thread::sleep(Duration::from_millis(200));
        list.push_back(1);
        assert_eq!(collect(&list), vec![1]);
    }
}
