//! Wire representation of a single fragment.
//!
//! Each transport message carries exactly one [`Fragment`] encoded as a JSON
//! object. Besides the fragment position (`index` of `count`) every fragment
//! repeats the metadata of the logical message it belongs to, so the first
//! fragment to arrive is enough to rebuild the message header.

use serde::{Deserialize, Serialize};

use super::{FrameError, MessageId};

/// Default command stamped on error frames sent in response to bad input.
pub const ERROR_COMMAND: &str = "error";

const fn default_count() -> u32 { 1 }

/// One wire-level piece of a split logical message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    #[serde(rename = "id")]
    identity: MessageId,
    #[serde(rename = "replyto", default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<MessageId>,
    #[serde(default)]
    command: String,
    #[serde(rename = "data", default)]
    payload: String,
    #[serde(default = "default_count")]
    count: u32,
    #[serde(default)]
    index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Metadata shared by every fragment of one logical message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FragmentMeta {
    pub identity: MessageId,
    pub reply_to: Option<MessageId>,
    pub command: String,
    pub error: Option<String>,
}

impl Fragment {
    /// Build a fragment at `index` of `count` carrying `payload`.
    #[must_use]
    pub fn new(meta: FragmentMeta, index: u32, count: u32, payload: impl Into<String>) -> Self {
        let FragmentMeta {
            identity,
            reply_to,
            command,
            error,
        } = meta;
        Self {
            identity,
            reply_to,
            command,
            payload: payload.into(),
            count,
            index,
            error,
        }
    }

    /// Decode and validate one transport message.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] when the input is not a fragment object, has no
    /// identity, declares a zero count, or places its index outside
    /// `[0, count)`.
    pub fn from_wire(raw: &str) -> Result<Self, FrameError> {
        let fragment: Self = serde_json::from_str(raw)?;
        fragment.validate()?;
        Ok(fragment)
    }

    /// Encode the fragment for a single transport write.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Malformed`] if serialization fails.
    pub fn to_wire(&self) -> Result<String, FrameError> { Ok(serde_json::to_string(self)?) }

    fn validate(&self) -> Result<(), FrameError> {
        if self.identity.is_empty() {
            return Err(FrameError::MissingIdentity);
        }
        if self.count == 0 {
            return Err(FrameError::ZeroCount {
                identity: self.identity.clone(),
            });
        }
        if self.index >= self.count {
            return Err(FrameError::IndexOutOfRange {
                identity: self.identity.clone(),
                index: self.index,
                count: self.count,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn identity(&self) -> &MessageId { &self.identity }

    #[must_use]
    pub fn reply_to(&self) -> Option<&MessageId> { self.reply_to.as_ref() }

    #[must_use]
    pub fn command(&self) -> &str { &self.command }

    #[must_use]
    pub fn payload(&self) -> &str { &self.payload }

    #[must_use]
    pub const fn count(&self) -> u32 { self.count }

    #[must_use]
    pub const fn index(&self) -> u32 { self.index }

    #[must_use]
    pub fn error(&self) -> Option<&str> { self.error.as_deref() }

    /// Clone the message metadata carried by this fragment.
    #[must_use]
    pub fn meta(&self) -> FragmentMeta {
        FragmentMeta {
            identity: self.identity.clone(),
            reply_to: self.reply_to.clone(),
            command: self.command.clone(),
            error: self.error.clone(),
        }
    }

    /// Consume the fragment, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> String { self.payload }
}
