//! Error types emitted by the fragmentation layer.
//!
//! Each failure is local to one transport message or one message identity;
//! none of them terminate the owning session.

use std::num::NonZeroUsize;

use thiserror::Error;

use super::MessageId;

/// Raw transport input that could not be turned into a [`Fragment`](super::Fragment).
#[derive(Debug, Error)]
pub enum FrameError {
    /// The input is not a JSON fragment object.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The fragment carries no message identity.
    #[error("fragment has no identity")]
    MissingIdentity,
    /// The fragment declares that its message has no fragments.
    #[error("fragment count for {identity} must be at least 1")]
    ZeroCount { identity: MessageId },
    /// The fragment index falls outside `[0, count)`.
    #[error("fragment index {index} out of range for count {count} on {identity}")]
    IndexOutOfRange {
        identity: MessageId,
        index: u32,
        count: u32,
    },
}

/// Errors produced while fragmenting outbound messages.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FragmentationError {
    /// The payload needs more fragments than a `u32` index can address.
    #[error("payload requires {fragments} fragments, more than the index can address")]
    IndexOverflow { fragments: usize },
}

/// Errors produced while reassembling inbound fragments.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    /// Too many fragments are buffered; the offending identity was discarded.
    #[error(
        "reassembly buffer holds {buffered} fragments, over the ceiling of {ceiling}; discarded \
         {discarded} fragments of {identity}"
    )]
    Overflow {
        identity: MessageId,
        buffered: usize,
        discarded: usize,
        ceiling: NonZeroUsize,
    },
    /// A fragment disagreed with its siblings about the total count.
    #[error("fragment count mismatch for {identity}: expected {expected}, found {found}")]
    CountMismatch {
        identity: MessageId,
        expected: u32,
        found: u32,
    },
}
