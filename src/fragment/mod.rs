//! Fragment primitives for transparent message splitting.
//!
//! This module collects the domain types used by the fragmentation and
//! reassembly layer: the wire [`Fragment`], the outbound [`Fragmenter`], and
//! the inbound [`ReassemblyBuffer`].

pub mod error;
pub mod fragmenter;
pub mod frame;
pub mod id;
pub mod reassembler;

pub use error::{FragmentationError, FrameError, ReassemblyError};
pub use fragmenter::{FragmentBatch, Fragmenter, decode_fragments};
pub use frame::{ERROR_COMMAND, Fragment, FragmentMeta};
pub use id::MessageId;
pub use reassembler::ReassemblyBuffer;

#[cfg(test)]
mod tests;
