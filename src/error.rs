use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error that can be returned by container and cursor operations.
///
/// Internal contention retries and reclamation races are handled by
/// looping and are never surfaced; only semantic misuse reaches the
/// caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A lookup was performed for a key that is not in the map.
    #[error("key not found")]
    KeyNotFound,

    /// A cursor parked on a boundary sentinel was read or written.
    #[error("cursor does not point at a readable element")]
    InvalidCursor,
}
