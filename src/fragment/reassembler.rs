//! Inbound buffer that stitches fragments back into complete messages.
//!
//! [`ReassemblyBuffer`] mirrors the outbound [`Fragmenter`](crate::fragment::Fragmenter)
//! by grouping fragments per [`MessageId`]. Fragments may arrive in any order
//! and different identities may interleave freely; a group completes once it
//! holds as many distinct indices as its declared count.
//!
//! Memory is bounded by a ceiling on the number of buffered fragments summed
//! over all identities. Crossing the ceiling sheds the group currently being
//! admitted; the sender is expected to resend. Stale partial groups can also
//! be evicted after an optional timeout.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use tracing::{debug, error, warn};

use super::{Fragment, MessageId, ReassemblyError};
use crate::{message::LogicalMessage, metrics};

#[derive(Debug)]
struct PartialMessage {
    count: u32,
    fragments: Vec<Fragment>,
    started_at: Instant,
}

impl PartialMessage {
    fn new(fragment: Fragment, started_at: Instant) -> Self {
        Self {
            count: fragment.count(),
            fragments: vec![fragment],
            started_at,
        }
    }

    fn contains(&self, index: u32) -> bool { self.fragments.iter().any(|f| f.index() == index) }

    fn is_complete(&self) -> bool { self.fragments.len() == self.count as usize }

    fn len(&self) -> usize { self.fragments.len() }

    fn into_message(mut self) -> Option<LogicalMessage> {
        self.fragments.sort_by_key(Fragment::index);
        LogicalMessage::from_sorted_fragments(&self.fragments)
    }
}

/// Per-connection fragment reassembly state.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    ceiling: NonZeroUsize,
    timeout: Option<Duration>,
    groups: HashMap<MessageId, PartialMessage>,
    buffered: usize,
}

impl ReassemblyBuffer {
    /// Create a buffer that sheds input once more than `ceiling` fragments are held.
    #[must_use]
    pub fn new(ceiling: NonZeroUsize) -> Self {
        Self {
            ceiling,
            timeout: None,
            groups: HashMap::new(),
            buffered: 0,
        }
    }

    /// Evict partial messages older than `timeout` on each admission.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Admit a fragment using the current time.
    ///
    /// Returns `Ok(Some(_))` when the fragment completes its message and
    /// `Ok(None)` while more fragments are required. Duplicate indices are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError::Overflow`] when the ceiling is crossed and
    /// [`ReassemblyError::CountMismatch`] when the fragment contradicts the
    /// count declared by earlier fragments. Either way the group for the
    /// fragment's identity is discarded.
    pub fn admit(&mut self, fragment: Fragment) -> Result<Option<LogicalMessage>, ReassemblyError> {
        self.admit_at(fragment, Instant::now())
    }

    /// Admit a fragment using an explicit clock reading.
    ///
    /// # Errors
    ///
    /// See [`ReassemblyBuffer::admit`].
    pub fn admit_at(
        &mut self,
        fragment: Fragment,
        now: Instant,
    ) -> Result<Option<LogicalMessage>, ReassemblyError> {
        self.purge_expired_at(now);

        let identity = fragment.identity().clone();
        debug!(
            %identity,
            index = fragment.index(),
            count = fragment.count(),
            "fragment admitted"
        );

        if let Some(partial) = self.groups.get_mut(&identity) {
            if partial.count != fragment.count() {
                let expected = partial.count;
                self.discard(&identity);
                return Err(ReassemblyError::CountMismatch {
                    identity,
                    expected,
                    found: fragment.count(),
                });
            }
            if partial.contains(fragment.index()) {
                warn!(%identity, index = fragment.index(), "duplicate fragment ignored");
                return Ok(None);
            }
            partial.fragments.push(fragment);
        } else {
            if fragment.count() == 1 {
                return Ok(Some(LogicalMessage::from_single_fragment(fragment)));
            }
            self.groups
                .insert(identity.clone(), PartialMessage::new(fragment, now));
        }
        self.buffered += 1;

        if self.groups.get(&identity).is_some_and(PartialMessage::is_complete) {
            return Ok(self.take(&identity).and_then(PartialMessage::into_message));
        }

        if self.buffered > self.ceiling.get() {
            let buffered = self.buffered;
            let discarded = self.discard(&identity);
            metrics::inc_reassembly_overflows();
            error!(
                %identity,
                buffered,
                discarded,
                ceiling = self.ceiling.get(),
                "reassembly buffer over ceiling; discarding message fragments"
            );
            return Err(ReassemblyError::Overflow {
                identity,
                buffered,
                discarded,
                ceiling: self.ceiling,
            });
        }

        Ok(None)
    }

    /// Remove partial messages that exceeded the configured timeout.
    ///
    /// Returns the identities that were evicted.
    pub fn purge_expired(&mut self) -> Vec<MessageId> { self.purge_expired_at(Instant::now()) }

    /// Remove expired partial messages using an explicit clock reading.
    pub fn purge_expired_at(&mut self, now: Instant) -> Vec<MessageId> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        let mut released = 0;
        self.groups.retain(|identity, partial| {
            let expired = now.saturating_duration_since(partial.started_at) >= timeout;
            if expired {
                warn!(%identity, held = partial.len(), "evicting stale partial message");
                released += partial.len();
                evicted.push(identity.clone());
            }
            !expired
        });
        self.buffered -= released;
        evicted
    }

    /// Drop every partial message.
    pub fn clear(&mut self) {
        self.groups.clear();
        self.buffered = 0;
    }

    /// Number of partial messages currently buffered.
    #[must_use]
    pub fn pending_messages(&self) -> usize { self.groups.len() }

    /// Number of fragments currently buffered across all identities.
    #[must_use]
    pub fn buffered_fragments(&self) -> usize { self.buffered }

    /// Configured ceiling on buffered fragments.
    #[must_use]
    pub const fn ceiling(&self) -> NonZeroUsize { self.ceiling }

    fn take(&mut self, identity: &MessageId) -> Option<PartialMessage> {
        let partial = self.groups.remove(identity)?;
        self.buffered -= partial.len();
        Some(partial)
    }

    fn discard(&mut self, identity: &MessageId) -> usize {
        self.take(identity).map_or(0, |partial| partial.len())
    }
}
