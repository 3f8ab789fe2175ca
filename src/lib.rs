//! This library provides concurrent, in-memory ordered containers whose
//! iterators stay usable across concurrent mutation.
//!
//! Two containers are offered: [`AvlMap`], an ordered map backed by a
//! self-balancing binary search tree behind a single readers/writer lock,
//! and a doubly-linked sequence at two locking granularities, [`CoarseList`]
//! (one container-wide lock) and [`FineList`] (per-node locks with a
//! background reclamation worker).
//!
//! The common machinery is a reference-counted node lifecycle: erasing an
//! element that a cursor still points at detaches the node from the
//! structure but keeps it alive in a removed state, with enough outgoing
//! pointers intact for the cursor to escape to a live neighbour. A node is
//! only freed once the last reference to it is gone.

pub mod avl;
pub mod list;

mod error;

pub use avl::AvlMap;
pub use error::{Error, Result};
pub use list::{CoarseList, FineList};
