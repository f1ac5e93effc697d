//! Complete, reassembled messages exchanged with a peer.
//!
//! A [`LogicalMessage`] is what the session hands to business dispatch and
//! what callers give to [`Session::send_request`](crate::session::Session::send_request).
//! Its payload is opaque text; only the identity, the reply marker, and the
//! optional error text are interpreted by this crate.

use crate::fragment::{Fragment, FragmentMeta, MessageId, decode_fragments};

/// A logical message plus the metadata needed to correlate it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogicalMessage {
    id: MessageId,
    command: String,
    data: String,
    reply_to: Option<MessageId>,
    error: Option<String>,
}

impl LogicalMessage {
    /// Create a fresh request without an identity.
    ///
    /// The session assigns an identity when the message is sent.
    #[must_use]
    pub fn new(command: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            data: data.into(),
            ..Self::default()
        }
    }

    /// Create a reply to `request` echoing its identity and command.
    #[must_use]
    pub fn reply_to(request: &Self, data: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            command: request.command.clone(),
            data: data.into(),
            reply_to: Some(request.id.clone()),
            error: None,
        }
    }

    /// Set the identity.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    /// Mark the message as a reply to `request_id`.
    #[must_use]
    pub fn with_reply_to(mut self, request_id: impl Into<MessageId>) -> Self {
        self.reply_to = Some(request_id.into());
        self
    }

    /// Attach error text; a reply carrying an error rejects its waiter.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Rebuild a message from fragments already sorted by index.
    pub(crate) fn from_sorted_fragments(fragments: &[Fragment]) -> Option<Self> {
        let first = fragments.first()?;
        let FragmentMeta {
            identity,
            reply_to,
            command,
            error,
        } = first.meta();
        Some(Self {
            id: identity,
            command,
            data: decode_fragments(fragments),
            reply_to,
            error,
        })
    }

    pub(crate) fn from_single_fragment(fragment: Fragment) -> Self {
        let meta = fragment.meta();
        Self {
            id: meta.identity,
            command: meta.command,
            data: fragment.into_payload(),
            reply_to: meta.reply_to,
            error: meta.error,
        }
    }

    pub(crate) fn assign_id(&mut self, id: MessageId) { self.id = id; }

    /// Metadata repeated on every fragment of this message.
    #[must_use]
    pub fn fragment_meta(&self) -> FragmentMeta {
        FragmentMeta {
            identity: self.id.clone(),
            reply_to: self.reply_to.clone(),
            command: self.command.clone(),
            error: self.error.clone(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &MessageId { &self.id }

    #[must_use]
    pub fn command(&self) -> &str { &self.command }

    #[must_use]
    pub fn data(&self) -> &str { &self.data }

    #[must_use]
    pub fn reply_to_id(&self) -> Option<&MessageId> { self.reply_to.as_ref() }

    #[must_use]
    pub fn error(&self) -> Option<&str> { self.error.as_deref() }

    /// Whether this message answers an earlier request.
    #[must_use]
    pub fn is_reply(&self) -> bool { self.reply_to.as_ref().is_some_and(|id| !id.is_empty()) }

    /// Consume the message, returning the payload.
    #[must_use]
    pub fn into_data(self) -> String { self.data }
}
