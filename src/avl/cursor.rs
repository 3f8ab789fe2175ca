use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{Error, Result};

use super::node::{dec, destroy_detached, in_order_next, in_order_prev, inc, Node, State};
use super::Core;

/// Pinned position inside an [`AvlMap`](super::AvlMap).
///
/// A cursor owns one strong reference to exactly one node and keeps it
/// alive even across an `erase` of that very key: the node is then
/// detached but stays readable, and the next advancement escapes along the
/// retained pointers to a live neighbour. Every hop briefly takes the
/// shared side of the container lock, so mutators can make progress
/// between steps.
pub struct Cursor<K, V> {
    shared: Arc<RwLock<Core<K, V>>>,
    node: NonNull<Node<K, V>>,
    /// Last observed state of the pinned node. Exact for the permanent
    /// end sentinel, advisory otherwise.
    state: State,
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for Cursor<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Cursor<K, V> {}

impl<K, V> Cursor<K, V> {
    pub(crate) fn pin_first(shared: Arc<RwLock<Core<K, V>>>) -> Self {
        let (node, state) = {
            let core = shared.read();
            let node = core.first();
            unsafe {
                inc(node);
                (node, node.as_ref().state)
            }
        };
        Self { shared, node, state }
    }

    pub(crate) fn pin_end(shared: Arc<RwLock<Core<K, V>>>) -> Self {
        let node = {
            let core = shared.read();
            let node = core.end_node();
            unsafe { inc(node) };
            node
        };
        Self {
            shared,
            node,
            state: State::End,
        }
    }

    /// Whether the cursor is parked on the end sentinel. The sentinel is
    /// permanent, so no lock is needed.
    pub fn is_end(&self) -> bool {
        self.state == State::End
    }

    /// Read the key under the cursor. Removed nodes retain their entry;
    /// only the boundary sentinels are unreadable.
    pub fn key(&self) -> Result<K>
    where
        K: Clone,
    {
        let _guard = self.shared.read();
        unsafe {
            match &self.node.as_ref().entry {
                Some((k, _)) => Ok(k.clone()),
                None => Err(Error::InvalidCursor),
            }
        }
    }

    /// Read the value under the cursor.
    pub fn value(&self) -> Result<V>
    where
        V: Clone,
    {
        let _guard = self.shared.read();
        unsafe {
            match &self.node.as_ref().entry {
                Some((_, v)) => Ok(v.clone()),
                None => Err(Error::InvalidCursor),
            }
        }
    }

    /// Move to the in-order successor; stays put on the end sentinel.
    ///
    /// From a removed node the hop sequence follows the retained pointers
    /// out of the detached region and then walks in-order until the key
    /// strictly exceeds the departed one, so a single advancement always
    /// lands on a live node or the end sentinel.
    pub fn advance(&mut self)
    where
        K: Ord + Clone,
    {
        if self.state == State::End {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let guard = shared.read();
        let core = &*guard;
        unsafe {
            match self.node.as_ref().state {
                State::End => {}
                State::Valid | State::Begin => {
                    let next = in_order_next(self.node, core.end_node());
                    self.hop(next);
                }
                State::Removed => self.escape_forward(core),
                // never handed out; park on the end sentinel
                State::Free | State::Root => {
                    let end = core.end_node();
                    self.hop(end);
                }
            }
            self.state = self.node.as_ref().state;
        }
    }

    /// Move to the in-order predecessor. From the end sentinel this lands
    /// on the current maximum; on the minimum it stays put.
    pub fn retreat(&mut self)
    where
        K: Ord + Clone,
    {
        let shared = Arc::clone(&self.shared);
        let guard = shared.read();
        let core = &*guard;
        unsafe {
            match self.node.as_ref().state {
                State::End => {
                    if let Some(max) = core.end_node().as_ref().parent {
                        self.hop(max);
                    }
                }
                State::Begin => {}
                State::Valid => {
                    if let Some(prev) = in_order_prev(self.node) {
                        self.hop(prev);
                    }
                }
                State::Removed => self.escape_backward(core),
                State::Free | State::Root => {
                    let end = core.end_node();
                    self.hop(end);
                }
            }
            self.state = self.node.as_ref().state;
        }
    }

    /// Escape forward out of a removed node: the retained right pointer
    /// still aims at an in-tree successor side, the parent pointer leads
    /// back towards the tree otherwise.
    unsafe fn escape_forward(&mut self, core: &Core<K, V>)
    where
        K: Ord + Clone,
    {
        let departed = self.node.as_ref().key().clone();
        loop {
            let cur = self.node;
            match cur.as_ref().state {
                State::Removed => {
                    if let Some(r) = cur.as_ref().right {
                        self.hop(r);
                    } else if let Some(p) = cur.as_ref().parent {
                        self.hop(p);
                    } else if let Some(l) = cur.as_ref().left {
                        self.hop(l);
                    } else {
                        let end = core.end_node();
                        self.hop(end);
                        return;
                    }
                }
                State::Valid | State::Begin => {
                    if *cur.as_ref().key() > departed {
                        return;
                    }
                    let next = in_order_next(cur, core.end_node());
                    self.hop(next);
                }
                State::End => return,
                State::Free | State::Root => {
                    let end = core.end_node();
                    self.hop(end);
                    return;
                }
            }
        }
    }

    /// Mirror image of [`Cursor::escape_forward`].
    unsafe fn escape_backward(&mut self, core: &Core<K, V>)
    where
        K: Ord + Clone,
    {
        let departed = self.node.as_ref().key().clone();
        loop {
            let cur = self.node;
            match cur.as_ref().state {
                State::Removed => {
                    if let Some(l) = cur.as_ref().left {
                        self.hop(l);
                    } else if let Some(p) = cur.as_ref().parent {
                        self.hop(p);
                    } else if let Some(r) = cur.as_ref().right {
                        self.hop(r);
                    } else {
                        let first = core.first();
                        self.hop(first);
                        return;
                    }
                }
                State::Valid | State::Begin => {
                    if *cur.as_ref().key() < departed {
                        return;
                    }
                    match in_order_prev(cur) {
                        Some(prev) => self.hop(prev),
                        // reached the minimum; backward stays at begin
                        None => return,
                    }
                }
                State::End | State::Free | State::Root => {
                    let first = core.first();
                    self.hop(first);
                    return;
                }
            }
        }
    }

    /// Re-pin the cursor: the new target gains its reference before the
    /// old node loses ours, then a node left at zero is destroyed.
    unsafe fn hop(&mut self, to: NonNull<Node<K, V>>) {
        if to == self.node {
            return;
        }
        inc(to);
        let old = self.node;
        self.node = to;
        if dec(old) {
            destroy_detached(old);
        }
    }

    #[cfg(test)]
    pub(crate) fn pinned_refs(&self) -> usize {
        unsafe {
            self.node
                .as_ref()
                .refs
                .load(std::sync::atomic::Ordering::Relaxed)
        }
    }
}

impl<K, V> Clone for Cursor<K, V> {
    fn clone(&self) -> Self {
        // the clone's reference is taken before anything else; the source
        // cursor already pins the node, so the count cannot be zero
        unsafe { inc(self.node) };
        Self {
            shared: Arc::clone(&self.shared),
            node: self.node,
            state: self.state,
        }
    }
}

impl<K, V> PartialEq for Cursor<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl<K, V> Eq for Cursor<K, V> {}

impl<K, V> Drop for Cursor<K, V> {
    fn drop(&mut self) {
        let guard = self.shared.read();
        unsafe {
            if dec(self.node) {
                destroy_detached(self.node);
            }
        }
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use crate::{AvlMap, Error};

    #[test]
    fn clone_and_drop_keep_the_count_balanced() {
        let map = AvlMap::new();
        map.insert(1, 1);

        let cur = map.begin();
        let pinned = cur.pinned_refs();

        let copy = cur.clone();
        assert_eq!(cur.pinned_refs(), pinned + 1);

        drop(copy);
        assert_eq!(cur.pinned_refs(), pinned);
    }

    #[test]
    fn advancing_off_the_end_stays_there() {
        let map = AvlMap::new();
        map.insert(1, 1);

        let mut cur = map.begin();
        cur.advance();
        assert!(cur.is_end());
        cur.advance();
        assert!(cur.is_end());
    }

    #[test]
    fn reading_the_end_sentinel_is_an_error() {
        let map: AvlMap<i32, i32> = AvlMap::new();
        let cur = map.end();

        assert_eq!(cur.key(), Err(Error::InvalidCursor));
        assert_eq!(cur.value(), Err(Error::InvalidCursor));
    }

    #[test]
    fn retreating_from_end_lands_on_the_maximum() {
        let map: AvlMap<i32, i32> = (0..5).map(|k| (k, k)).collect();

        let mut cur = map.end();
        cur.retreat();
        assert_eq!(cur.key(), Ok(4));
    }

    #[test]
    fn removed_chain_collapses_once_released() {
        let map: AvlMap<i32, i32> = (0..3).map(|k| (k, k)).collect();

        let mut cur = map.begin();
        cur.advance();
        map.erase(&1);
        map.erase(&2);

        // pinned on removed key 1; key 2 may be pinned only through it
        assert_eq!(cur.key(), Ok(1));
        cur.advance();
        assert!(cur.is_end());

        assert_eq!(map.size(), 1);
        assert_eq!(map.at(&0), Ok(0));
    }
}
