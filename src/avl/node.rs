use std::cmp;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) type Link<K, V> = Option<NonNull<Node<K, V>>>;

/// Lifecycle tag of a tree node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// Allocated but not yet linked into the tree.
    Free,
    /// Ordinary keyed node.
    Valid,
    /// The node holding the smallest key.
    Begin,
    /// Anchor sentinel above the real root, so real nodes always have a
    /// parent.
    Root,
    /// Terminal sentinel past the largest key; its parent is the current
    /// maximum.
    End,
    /// Detached by erase but kept alive by outstanding cursors. Retains
    /// its entry and its outgoing pointers as escape routes.
    Removed,
}

/// AVL tree node.
///
/// `refs` counts the strong references aimed at this node: one per non-nil
/// structural pointer field of another node, one per live cursor pinned
/// here, and one container handle on each sentinel. Every pointer rewrite
/// goes through the balanced helpers below, so the count is exact at all
/// times.
pub(crate) struct Node<K, V> {
    /// Key-value payload. `None` only on the two sentinels.
    pub entry: Option<(K, V)>,

    pub parent: Link<K, V>,
    pub left: Link<K, V>,
    pub right: Link<K, V>,

    /// Subtree height, rooted in this node. 0 on sentinels.
    pub h: usize,

    pub state: State,
    pub refs: AtomicUsize,
}

impl<K, V> Node<K, V> {
    /// Allocate an unlinked node. It starts in the `Free` state with a
    /// zero count; linking it into the tree establishes its references.
    pub fn alloc(key: K, value: V) -> NonNull<Self> {
        NonNull::from(Box::leak(Box::new(Self {
            entry: Some((key, value)),
            parent: None,
            left: None,
            right: None,
            h: 1,
            state: State::Free,
            refs: AtomicUsize::new(0),
        })))
    }

    /// Allocate a sentinel. The count starts at one for the container's
    /// own handle, which keeps sentinels out of the destroy cascade.
    pub fn sentinel(state: State) -> NonNull<Self> {
        NonNull::from(Box::leak(Box::new(Self {
            entry: None,
            parent: None,
            left: None,
            right: None,
            h: 0,
            state,
            refs: AtomicUsize::new(1),
        })))
    }

    pub fn key(&self) -> &K {
        match &self.entry {
            Some((k, _)) => k,
            None => unreachable!("sentinels are never compared by key"),
        }
    }

    pub fn value(&self) -> &V {
        match &self.entry {
            Some((_, v)) => v,
            None => unreachable!("sentinels carry no value"),
        }
    }
}

pub(crate) unsafe fn inc<K, V>(node: NonNull<Node<K, V>>) {
    node.as_ref().refs.fetch_add(1, Ordering::Relaxed);
}

/// Drop one reference; returns true when the count reached zero.
pub(crate) unsafe fn dec<K, V>(node: NonNull<Node<K, V>>) -> bool {
    node.as_ref().refs.fetch_sub(1, Ordering::AcqRel) == 1
}

/// Height of an optional subtree.
pub(crate) unsafe fn height<K, V>(link: Link<K, V>) -> usize {
    link.map(|n| n.as_ref().h).unwrap_or(0)
}

pub(crate) unsafe fn balance<K, V>(node: NonNull<Node<K, V>>) -> isize {
    height(node.as_ref().left) as isize - height(node.as_ref().right) as isize
}

pub(crate) unsafe fn update_height<K, V>(node: NonNull<Node<K, V>>) {
    (*node.as_ptr()).h = 1 + cmp::max(height(node.as_ref().left), height(node.as_ref().right));
}

// The three field setters below keep the reference counts balanced on
// every pointer rewrite: the new target gains its reference before the old
// target loses the one it held. A count that transiently reaches zero
// mid-rewrite is re-established before the enclosing operation commits;
// the caller holds the exclusive container lock throughout, so nothing can
// observe the intermediate values.

pub(crate) unsafe fn set_left<K, V>(node: NonNull<Node<K, V>>, child: Link<K, V>) {
    if let Some(c) = child {
        inc(c);
    }
    if let Some(old) = mem::replace(&mut (*node.as_ptr()).left, child) {
        dec(old);
    }
}

pub(crate) unsafe fn set_right<K, V>(node: NonNull<Node<K, V>>, child: Link<K, V>) {
    if let Some(c) = child {
        inc(c);
    }
    if let Some(old) = mem::replace(&mut (*node.as_ptr()).right, child) {
        dec(old);
    }
}

pub(crate) unsafe fn set_parent<K, V>(node: NonNull<Node<K, V>>, parent: Link<K, V>) {
    if let Some(p) = parent {
        inc(p);
    }
    if let Some(old) = mem::replace(&mut (*node.as_ptr()).parent, parent) {
        dec(old);
    }
}

/// Replace whichever child slot of `parent` aims at `old` with `new`.
pub(crate) unsafe fn replace_child<K, V>(
    parent: NonNull<Node<K, V>>,
    old: NonNull<Node<K, V>>,
    new: Link<K, V>,
) {
    if parent.as_ref().left == Some(old) {
        set_left(parent, new);
    } else {
        debug_assert_eq!(parent.as_ref().right, Some(old));
        set_right(parent, new);
    }
}

pub(crate) unsafe fn find_min<K, V>(mut node: NonNull<Node<K, V>>) -> NonNull<Node<K, V>> {
    while let Some(l) = node.as_ref().left {
        node = l;
    }
    node
}

pub(crate) unsafe fn find_max<K, V>(mut node: NonNull<Node<K, V>>) -> NonNull<Node<K, V>> {
    while let Some(r) = node.as_ref().right {
        node = r;
    }
    node
}

/// In-order successor of an in-tree node; the end sentinel past the
/// maximum. Walks structure only, no key comparisons.
pub(crate) unsafe fn in_order_next<K, V>(
    node: NonNull<Node<K, V>>,
    end: NonNull<Node<K, V>>,
) -> NonNull<Node<K, V>> {
    if let Some(r) = node.as_ref().right {
        return find_min(r);
    }
    let mut cur = node;
    loop {
        let p = match cur.as_ref().parent {
            Some(p) => p,
            None => return end,
        };
        if p.as_ref().state == State::Root {
            return end;
        }
        if p.as_ref().left == Some(cur) {
            return p;
        }
        cur = p;
    }
}

/// In-order predecessor of an in-tree node; `None` at the minimum.
pub(crate) unsafe fn in_order_prev<K, V>(node: NonNull<Node<K, V>>) -> Link<K, V> {
    if let Some(l) = node.as_ref().left {
        return Some(find_max(l));
    }
    let mut cur = node;
    loop {
        let p = match cur.as_ref().parent {
            Some(p) => p,
            None => return None,
        };
        if p.as_ref().state == State::Root {
            return None;
        }
        if p.as_ref().right == Some(cur) {
            return Some(p);
        }
        cur = p;
    }
}

/// Free a node whose reference count reached zero, dropping its residual
/// outgoing references and cascading into any target that reaches zero in
/// turn. The cascade only ever crosses removed nodes: anything still in
/// the tree is held by its own structural references.
///
/// The caller must hold the container lock on either side; a zero count
/// means no cursor and no pointer aims at the node, so no other reader can
/// reach it.
pub(crate) unsafe fn destroy_detached<K, V>(node: NonNull<Node<K, V>>) {
    let mut stack = vec![node];
    while let Some(dead) = stack.pop() {
        debug_assert_eq!(dead.as_ref().refs.load(Ordering::Relaxed), 0);
        let boxed = Box::from_raw(dead.as_ptr());
        for target in [boxed.parent, boxed.left, boxed.right].iter().flatten() {
            if dec(*target) {
                stack.push(*target);
            }
        }
    }
}
