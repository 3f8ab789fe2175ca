//! Concurrent ordered map backed by a self-balancing binary search tree.
//!
//! A single readers/writer lock guards the tree: mutators serialise on the
//! exclusive side, while lookups and every individual cursor hop take the
//! shared side. Cursors pin their node with a strong reference, so erasing
//! a key never invalidates a cursor parked on it; see [`Cursor`].

mod cursor;
mod node;

use std::borrow::Borrow;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

pub use cursor::Cursor;

use crate::{Error, Result};
use node::{
    balance, destroy_detached, find_max, find_min, height, in_order_next, replace_child,
    set_left, set_parent, set_right, update_height, Link, Node, State,
};

/// Tree core: the anchor sentinel above the real root, the end sentinel
/// past the maximum, and the live-node count. Structural invariants are
/// maintained here, under the exclusive side of the container lock.
pub(crate) struct Core<K, V> {
    anchor: NonNull<Node<K, V>>,
    end: NonNull<Node<K, V>>,
    len: usize,
}

unsafe impl<K: Send, V: Send> Send for Core<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Core<K, V> {}

impl<K, V> Core<K, V> {
    fn new() -> Self {
        Self {
            anchor: Node::sentinel(State::Root),
            end: Node::sentinel(State::End),
            len: 0,
        }
    }

    pub(crate) fn end_node(&self) -> NonNull<Node<K, V>> {
        self.end
    }

    /// The minimum node, or the end sentinel when the map is empty.
    pub(crate) fn first(&self) -> NonNull<Node<K, V>> {
        match self.root() {
            Some(root) => unsafe { find_min(root) },
            None => self.end,
        }
    }

    fn root(&self) -> Link<K, V> {
        unsafe { self.anchor.as_ref().left }
    }
}

impl<K, V> Core<K, V>
where
    K: Ord,
{
    fn insert(&mut self, key: K, value: V) {
        unsafe {
            let mut cur = match self.root() {
                Some(root) => root,
                None => {
                    let leaf = Node::alloc(key, value);
                    set_left(self.anchor, Some(leaf));
                    set_parent(leaf, Some(self.anchor));
                    (*leaf.as_ptr()).state = State::Valid;
                    self.len = 1;
                    self.refresh_boundaries();
                    return;
                }
            };

            loop {
                if key < *cur.as_ref().key() {
                    match cur.as_ref().left {
                        Some(l) => cur = l,
                        None => {
                            let leaf = Node::alloc(key, value);
                            set_left(cur, Some(leaf));
                            set_parent(leaf, Some(cur));
                            (*leaf.as_ptr()).state = State::Valid;
                            break;
                        }
                    }
                } else if key > *cur.as_ref().key() {
                    match cur.as_ref().right {
                        Some(r) => cur = r,
                        None => {
                            let leaf = Node::alloc(key, value);
                            set_right(cur, Some(leaf));
                            set_parent(leaf, Some(cur));
                            (*leaf.as_ptr()).state = State::Valid;
                            break;
                        }
                    }
                } else {
                    // duplicate keys are silently rejected
                    return;
                }
            }

            self.len += 1;
            self.rebalance_upward(cur);
            self.refresh_boundaries();
        }
    }

    fn erase<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        unsafe {
            let n = {
                let mut cur = match self.root() {
                    Some(root) => root,
                    None => return,
                };
                loop {
                    let ck = cur.as_ref().key().borrow();
                    if key < ck {
                        match cur.as_ref().left {
                            Some(l) => cur = l,
                            None => return,
                        }
                    } else if key > ck {
                        match cur.as_ref().right {
                            Some(r) => cur = r,
                            None => return,
                        }
                    } else {
                        break cur;
                    }
                }
            };

            let rebalance_from = match (n.as_ref().left, n.as_ref().right) {
                (Some(_), Some(right)) => {
                    // two children: relink the in-order successor into n's
                    // slot, preserving its height and children
                    let s = find_min(right);
                    let sp = s.as_ref().parent.unwrap();
                    let from = if sp != n {
                        let rs = s.as_ref().right;
                        replace_child(sp, s, rs);
                        if let Some(rs) = rs {
                            set_parent(rs, Some(sp));
                        }
                        sp
                    } else {
                        // the successor is n's own right child and stays
                        // where it is, adopting n's left subtree below
                        s
                    };

                    let p = n.as_ref().parent.unwrap();
                    replace_child(p, n, Some(s));
                    set_parent(s, Some(p));
                    set_left(s, n.as_ref().left);
                    if let Some(l) = n.as_ref().left {
                        set_parent(l, Some(s));
                    }
                    if sp != n {
                        set_right(s, n.as_ref().right);
                        if let Some(r) = n.as_ref().right {
                            set_parent(r, Some(s));
                        }
                    }
                    (*s.as_ptr()).h = n.as_ref().h;
                    from
                }
                (left, right) => {
                    // at most one child: splice it into n's slot
                    let c = left.or(right);
                    let p = n.as_ref().parent.unwrap();
                    replace_child(p, n, c);
                    if let Some(c) = c {
                        set_parent(c, Some(p));
                    }
                    p
                }
            };

            self.rebalance_upward(rebalance_from);
            self.len -= 1;
            self.refresh_boundaries();

            // n now holds only references beyond the structural ones,
            // i.e. cursors (directly, or through earlier removed nodes)
            if n.as_ref().refs.load(Ordering::Acquire) == 0 {
                destroy_detached(n);
            } else {
                (*n.as_ptr()).state = State::Removed;
                trace!(len = self.len, "erased node kept alive for outstanding cursors");
            }
        }
    }

    /// Recompute heights from `from` up to the anchor, restoring the
    /// balance invariant with single or double rotations on the way.
    unsafe fn rebalance_upward(&mut self, mut cur: NonNull<Node<K, V>>) {
        while cur.as_ref().state != State::Root {
            update_height(cur);
            let b = balance(cur);
            let top = if b > 1 {
                let l = cur.as_ref().left.unwrap();
                if balance(l) < 0 {
                    rotate_left(l);
                }
                rotate_right(cur)
            } else if b < -1 {
                let r = cur.as_ref().right.unwrap();
                if balance(r) > 0 {
                    rotate_right(r);
                }
                rotate_left(cur)
            } else {
                cur
            };
            cur = top.as_ref().parent.unwrap();
        }
    }

    /// Re-establish the boundaries after a structural change: the minimum
    /// node carries the Begin tag and the end sentinel's parent is the
    /// maximum node.
    unsafe fn refresh_boundaries(&mut self) {
        match self.root() {
            Some(root) => {
                let m = find_min(root);
                if m.as_ref().state != State::Begin {
                    // the displaced minimum, if still in the tree, is the
                    // new minimum's in-order successor
                    let s = in_order_next(m, self.end);
                    if s != self.end && s.as_ref().state == State::Begin {
                        (*s.as_ptr()).state = State::Valid;
                    }
                    (*m.as_ptr()).state = State::Begin;
                }
                let mx = find_max(root);
                if self.end.as_ref().parent != Some(mx) {
                    set_parent(self.end, Some(mx));
                }
            }
            None => {
                if self.end.as_ref().parent.is_some() {
                    set_parent(self.end, None);
                }
            }
        }
    }

    fn at<Q>(&self, key: &Q) -> Result<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        V: Clone,
    {
        unsafe {
            let mut cur = self.root().ok_or(Error::KeyNotFound)?;
            loop {
                let ck = cur.as_ref().key().borrow();
                if key < ck {
                    cur = cur.as_ref().left.ok_or(Error::KeyNotFound)?;
                } else if key > ck {
                    cur = cur.as_ref().right.ok_or(Error::KeyNotFound)?;
                } else {
                    return Ok(cur.as_ref().value().clone());
                }
            }
        }
    }
}

impl<K, V> Drop for Core<K, V> {
    fn drop(&mut self) {
        // Teardown ignores reference counts: no cursor can be alive here
        // (cursors hold the container), so every remaining node is
        // reachable from the anchor or is the end sentinel.
        unsafe {
            let mut stack = vec![self.anchor];
            while let Some(n) = stack.pop() {
                let boxed = Box::from_raw(n.as_ptr());
                if let Some(l) = boxed.left {
                    stack.push(l);
                }
                if let Some(r) = boxed.right {
                    stack.push(r);
                }
            }
            drop(Box::from_raw(self.end.as_ptr()));
        }
    }
}

/// Rotate the subtree rooted at `x` to the left; returns the new subtree
/// top. Every pointer rewrite is individually balanced, so the counts net
/// to zero across the rotation.
unsafe fn rotate_left<K, V>(x: NonNull<Node<K, V>>) -> NonNull<Node<K, V>> {
    let y = x.as_ref().right.unwrap();
    let b = y.as_ref().left;
    let p = x.as_ref().parent.unwrap();

    replace_child(p, x, Some(y));
    set_parent(y, Some(p));
    set_right(x, b);
    if let Some(b) = b {
        set_parent(b, Some(x));
    }
    set_left(y, Some(x));
    set_parent(x, Some(y));

    update_height(x);
    update_height(y);
    y
}

/// Mirror image of [`rotate_left`].
unsafe fn rotate_right<K, V>(x: NonNull<Node<K, V>>) -> NonNull<Node<K, V>> {
    let y = x.as_ref().left.unwrap();
    let b = y.as_ref().right;
    let p = x.as_ref().parent.unwrap();

    replace_child(p, x, Some(y));
    set_parent(y, Some(p));
    set_left(x, b);
    if let Some(b) = b {
        set_parent(b, Some(x));
    }
    set_right(y, Some(x));
    set_parent(x, Some(y));

    update_height(x);
    update_height(y);
    y
}

/// Concurrent ordered map with cursors that survive concurrent erasure.
///
/// Mutations serialise on the exclusive side of one readers/writer lock;
/// lookups and cursor hops take the shared side, so readers observe a
/// consistent snapshot for the duration of any single operation.
///
/// Keys are immutable and totally ordered; inserting an existing key is a
/// no-op.
pub struct AvlMap<K, V> {
    shared: Arc<RwLock<Core<K, V>>>,
}

impl<K, V> AvlMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RwLock::new(Core::new())),
        }
    }

    /// Insert a key-value pair. A no-op if the key is already present.
    pub fn insert(&self, key: K, value: V) {
        self.shared.write().insert(key, value);
    }

    /// Remove the node holding `key`, if any. A cursor parked on it keeps
    /// the node readable until the cursor moves on or is dropped.
    pub fn erase<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.shared.write().erase(key);
    }

    /// Get the value associated with `key`.
    pub fn at<Q>(&self, key: &Q) -> Result<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.shared.read().at(key)
    }

    /// Current count of live keyed nodes.
    pub fn size(&self) -> usize {
        self.shared.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Height of the tree; 0 when empty.
    pub fn height(&self) -> usize {
        let core = self.shared.read();
        unsafe { height(core.root()) }
    }

    /// The smallest key and its value.
    pub fn min(&self) -> Result<(K, V)> {
        let core = self.shared.read();
        let root = core.root().ok_or(Error::KeyNotFound)?;
        unsafe {
            let m = find_min(root);
            let (k, v) = m.as_ref().entry.as_ref().ok_or(Error::KeyNotFound)?;
            Ok((k.clone(), v.clone()))
        }
    }

    /// The largest key and its value.
    pub fn max(&self) -> Result<(K, V)> {
        let core = self.shared.read();
        let root = core.root().ok_or(Error::KeyNotFound)?;
        unsafe {
            let m = find_max(root);
            let (k, v) = m.as_ref().entry.as_ref().ok_or(Error::KeyNotFound)?;
            Ok((k.clone(), v.clone()))
        }
    }

    /// Cursor pinned to the smallest key; equals `end()` when empty.
    pub fn begin(&self) -> Cursor<K, V> {
        Cursor::pin_first(Arc::clone(&self.shared))
    }

    /// Cursor parked on the end sentinel.
    pub fn end(&self) -> Cursor<K, V> {
        Cursor::pin_end(Arc::clone(&self.shared))
    }
}

impl<K, V> Default for AvlMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::iter::FromIterator<(K, V)> for AvlMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

#[cfg(test)]
impl<K, V> AvlMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn validate(&self) {
        self.shared.read().validate();
    }
}

#[cfg(test)]
impl<K: Ord, V> Core<K, V> {
    /// Full structural audit: parent pointers, key ordering, heights, the
    /// balance bound, boundary tags, and reference counts. The refcount
    /// assertions hold only while no cursor is alive.
    fn validate(&self) {
        unsafe {
            let anchor_refs = self.anchor.as_ref().refs.load(Ordering::Relaxed);
            assert_eq!(anchor_refs, 1 + self.root().is_some() as usize);
            match self.root() {
                Some(root) => {
                    assert_eq!(root.as_ref().parent, Some(self.anchor));
                    let mut count = 0;
                    self.check(root, &mut count);
                    assert_eq!(count, self.len);
                    assert_eq!(self.end.as_ref().parent, Some(find_max(root)));
                    assert_eq!(find_min(root).as_ref().state, State::Begin);
                }
                None => {
                    assert_eq!(self.len, 0);
                    assert_eq!(self.end.as_ref().parent, None);
                }
            }
        }
    }

    unsafe fn check(&self, node: NonNull<Node<K, V>>, count: &mut usize) {
        *count += 1;
        let mut expected = 1; // the parent's child slot
        if let Some(l) = node.as_ref().left {
            assert_eq!(l.as_ref().parent, Some(node));
            assert!(l.as_ref().key() < node.as_ref().key());
            self.check(l, count);
            expected += 1;
        }
        if let Some(r) = node.as_ref().right {
            assert_eq!(r.as_ref().parent, Some(node));
            assert!(r.as_ref().key() > node.as_ref().key());
            self.check(r, count);
            expected += 1;
        }
        if self.end.as_ref().parent == Some(node) {
            expected += 1;
        }
        assert_eq!(node.as_ref().refs.load(Ordering::Relaxed), expected);

        let hl = height(node.as_ref().left);
        let hr = height(node.as_ref().right);
        assert_eq!(node.as_ref().h, 1 + std::cmp::max(hl, hr));
        assert!((hl as isize - hr as isize).abs() <= 1);

        if node.as_ref().state == State::Begin {
            assert_eq!(node.as_ref().left, None);
        } else {
            assert_eq!(node.as_ref().state, State::Valid);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::thread;

    use rand::Rng;

    use super::AvlMap;
    use crate::Error;

    fn keys_forward(map: &AvlMap<i32, i32>) -> Vec<i32> {
        let mut keys = Vec::new();
        let mut cur = map.begin();
        while !cur.is_end() {
            keys.push(cur.key().unwrap());
            cur.advance();
        }
        keys
    }

    #[test]
    fn inserted_data_is_retrievable() {
        let map = AvlMap::new();
        map.insert("Hello, world!".to_owned(), 20);

        assert_eq!(map.at("Hello, world!"), Ok(20));
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn missing_key_is_an_error() {
        let map: AvlMap<i32, i32> = AvlMap::new();

        assert_eq!(map.at(&7), Err(Error::KeyNotFound));
    }

    #[test]
    fn duplicate_insert_is_a_noop() {
        let map = AvlMap::new();
        map.insert(1, 10);
        map.insert(1, 20);

        assert_eq!(map.at(&1), Ok(10));
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn erase_then_reinsert_roundtrip() {
        let map: AvlMap<i32, i32> = (0..32).map(|k| (k, k * 2)).collect();
        let before = keys_forward(&map);

        map.insert(100, 0);
        map.erase(&100);

        assert_eq!(map.size(), 32);
        assert_eq!(keys_forward(&map), before);
        map.validate();
    }

    #[test]
    fn erase_absent_key_is_a_noop() {
        let map: AvlMap<i32, i32> = (0..8).map(|k| (k, k)).collect();
        map.erase(&99);

        assert_eq!(map.size(), 8);
        map.validate();
    }

    #[test]
    fn min_and_max_track_mutations() {
        let map = AvlMap::new();
        assert_eq!(map.min(), Err(Error::KeyNotFound));

        for k in [5, 1, 9, 3] {
            map.insert(k, k * 10);
        }
        assert_eq!(map.min(), Ok((1, 10)));
        assert_eq!(map.max(), Ok((9, 90)));

        map.erase(&1);
        map.erase(&9);
        assert_eq!(map.min(), Ok((3, 30)));
        assert_eq!(map.max(), Ok((5, 50)));
        map.validate();
    }

    #[test]
    fn ordered_insert_keeps_the_height_bound() {
        let n = 7000;
        let map: AvlMap<i32, i32> = (0..n).map(|k| (k, k)).collect();

        assert!(map.height() as f64 <= 1.44 * ((n + 2) as f64).log2());
        assert_eq!(keys_forward(&map), (0..n).collect::<Vec<_>>());
        map.validate();
    }

    #[test]
    fn random_erase_matches_a_reference_map() {
        let mut rng = rand::thread_rng();
        let map = AvlMap::new();
        let mut reference = BTreeMap::new();

        for k in 0..7000 {
            let v: i32 = rng.gen();
            map.insert(k, v);
            reference.insert(k, v);
        }
        for _ in 0..5000 {
            let k = rng.gen_range(0..5000);
            map.erase(&k);
            reference.remove(&k);
        }

        for k in 0..7000 {
            assert_eq!(map.at(&k).ok(), reference.get(&k).copied());
        }
        assert_eq!(map.size(), reference.len());
        assert_eq!(
            keys_forward(&map),
            reference.keys().copied().collect::<Vec<_>>()
        );
        map.validate();
    }

    #[test]
    fn cursor_survives_erase() {
        let map = AvlMap::new();
        map.insert(1, 2);
        map.insert(3, 4);
        map.insert(5, 6);

        let mut it = map.begin();
        it.advance();
        assert_eq!(it.key(), Ok(3));
        assert_eq!(it.value(), Ok(4));

        map.erase(&3);

        // the removed node is still readable through the cursor
        assert_eq!(it.key(), Ok(3));

        it.advance();
        assert_eq!(it.key(), Ok(5));
        assert_eq!(it.value(), Ok(6));
    }

    #[test]
    fn cursor_escapes_an_erased_maximum_to_end() {
        let map: AvlMap<i32, i32> = (0..4).map(|k| (k, k)).collect();

        let mut it = map.begin();
        while it.key() != Ok(3) {
            it.advance();
        }
        map.erase(&3);
        it.advance();

        assert!(it.is_end());
    }

    #[test]
    fn backward_traversal_is_monotonic() {
        let map: AvlMap<i32, i32> = [4, 1, 3, 0, 2].iter().map(|&k| (k, k)).collect();

        let mut it = map.end();
        let mut keys = Vec::new();
        loop {
            it.retreat();
            keys.push(it.key().unwrap());
            if it == map.begin() {
                break;
            }
        }

        assert_eq!(keys, vec![4, 3, 2, 1, 0]);

        // retreating off the minimum stays put
        it.retreat();
        assert_eq!(it.key(), Ok(0));
    }

    #[test]
    fn begin_equals_end_on_an_empty_map() {
        let map: AvlMap<i32, i32> = AvlMap::new();

        assert!(map.begin().is_end());
        assert!(map.begin() == map.end());
    }

    #[test]
    fn concurrent_inserts_keep_order_and_balance() {
        let n = 10_000;
        let map = Arc::new(AvlMap::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..n {
                        map.insert(rng.gen_range(0..n), rng.gen::<i32>());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(map.height() as f64 <= 1.44 * ((map.size() + 2) as f64).log2());

        let keys = keys_forward(&map);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));

        let mut it = map.end();
        let mut last = i32::MAX;
        loop {
            it.retreat();
            let k = it.key().unwrap();
            assert!(k < last);
            last = k;
            if it == map.begin() {
                break;
            }
        }
        map.validate();
    }

    #[test]
    fn iteration_survives_concurrent_erasure() {
        let n = 2000;
        let map: Arc<AvlMap<i32, i32>> = Arc::new((0..n).map(|k| (k, k)).collect());

        let erasers: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..n {
                        map.erase(&rng.gen_range(0..n));
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    let mut cur = map.begin();
                    let mut last = i32::MIN;
                    while !cur.is_end() {
                        let k = cur.key().unwrap();
                        assert!(k > last);
                        last = k;
                        cur.advance();
                    }
                })
            })
            .collect();

        for t in erasers.into_iter().chain(readers) {
            t.join().unwrap();
        }
        map.validate();
    }
}
