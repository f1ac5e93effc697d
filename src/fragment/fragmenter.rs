//! Outbound helper that splits logical messages into transport fragments.
//!
//! [`Fragmenter`] chunks a message payload into pieces of at most
//! `max_fragment_size` characters and tags each piece with the message
//! identity, its index and the total count. Splitting happens on character
//! boundaries so every fragment is valid text on its own.

use std::num::NonZeroUsize;

use super::{Fragment, FragmentationError, MessageId};
use crate::message::LogicalMessage;

/// Splits logical messages into fragment-sized frames.
#[derive(Clone, Copy, Debug)]
pub struct Fragmenter {
    max_fragment_size: NonZeroUsize,
}

impl Fragmenter {
    /// Create a fragmenter capping fragment payloads at `max_fragment_size` characters.
    #[must_use]
    pub const fn new(max_fragment_size: NonZeroUsize) -> Self { Self { max_fragment_size } }

    /// Return the maximum fragment payload size in characters.
    #[must_use]
    pub const fn max_fragment_size(&self) -> NonZeroUsize { self.max_fragment_size }

    /// Split `message` into fragments.
    ///
    /// The message identity is reused when present; otherwise a fresh one is
    /// generated and reported through [`FragmentBatch::message_id`].
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError::IndexOverflow`] if the payload needs more
    /// fragments than a `u32` index can address.
    pub fn fragment(&self, message: &LogicalMessage) -> Result<FragmentBatch, FragmentationError> {
        let message_id = if message.id().is_empty() {
            MessageId::generate()
        } else {
            message.id().clone()
        };
        self.fragment_with_id(message_id, message)
    }

    /// Split `message` into fragments tagged with `message_id`.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError::IndexOverflow`] if the payload needs more
    /// fragments than a `u32` index can address.
    pub fn fragment_with_id(
        &self,
        message_id: MessageId,
        message: &LogicalMessage,
    ) -> Result<FragmentBatch, FragmentationError> {
        let mut meta = message.fragment_meta();
        meta.identity = message_id.clone();

        let chunks = split_chars(message.data(), self.max_fragment_size.get());
        let count = u32::try_from(chunks.len()).map_err(|_| FragmentationError::IndexOverflow {
            fragments: chunks.len(),
        })?;

        let fragments = (0..count)
            .zip(chunks)
            .map(|(index, chunk)| Fragment::new(meta.clone(), index, count, chunk))
            .collect();
        Ok(FragmentBatch::new(message_id, fragments))
    }
}

/// Concatenate the payloads of fragments already sorted by index.
#[must_use]
pub fn decode_fragments(fragments: &[Fragment]) -> String {
    let capacity = fragments.iter().map(|f| f.payload().len()).sum();
    fragments
        .iter()
        .fold(String::with_capacity(capacity), |mut buffer, fragment| {
            buffer.push_str(fragment.payload());
            buffer
        })
}

/// Split `payload` into slices of at most `max` characters.
///
/// An empty payload yields a single empty slice so every message has at
/// least one fragment.
fn split_chars(payload: &str, max: usize) -> Vec<&str> {
    if payload.is_empty() {
        return vec![""];
    }
    let mut chunks = Vec::with_capacity(payload.len().div_ceil(max));
    let mut start = 0;
    let mut chars_in_chunk = 0;
    for (offset, _) in payload.char_indices() {
        if chars_in_chunk == max {
            chunks.push(&payload[start..offset]);
            start = offset;
            chars_in_chunk = 0;
        }
        chars_in_chunk += 1;
    }
    chunks.push(&payload[start..]);
    chunks
}

/// Collection of fragments produced for a single logical message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentBatch {
    message_id: MessageId,
    fragments: Vec<Fragment>,
}

impl FragmentBatch {
    fn new(message_id: MessageId, fragments: Vec<Fragment>) -> Self {
        debug_assert!(!fragments.is_empty(), "fragment batches must not be empty");
        Self {
            message_id,
            fragments,
        }
    }

    /// Return the identity shared by all fragments.
    #[must_use]
    pub fn message_id(&self) -> &MessageId { &self.message_id }

    /// Return the fragments as a slice.
    #[must_use]
    pub fn fragments(&self) -> &[Fragment] { self.fragments.as_slice() }

    /// Number of fragments in the batch.
    #[expect(
        clippy::len_without_is_empty,
        reason = "batches are guaranteed non-empty"
    )]
    #[must_use]
    pub fn len(&self) -> usize { self.fragments.len() }

    /// Whether the logical message required more than one fragment.
    #[must_use]
    pub fn is_fragmented(&self) -> bool { self.len() > 1 }

    /// Consume the batch, returning all fragments.
    #[must_use]
    pub fn into_fragments(self) -> Vec<Fragment> { self.fragments }
}

impl IntoIterator for FragmentBatch {
    type Item = Fragment;
    type IntoIter = std::vec::IntoIter<Fragment>;

    fn into_iter(self) -> Self::IntoIter { self.fragments.into_iter() }
}
