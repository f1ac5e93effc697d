//! Identities shared by the fragments of one logical message.

use derive_more::{Display, From, Into};
use rand::Rng;
use serde::{Deserialize, Serialize};

const ID_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const GENERATED_ID_LEN: usize = 9;

/// Identity of a logical message undergoing fragmentation.
///
/// The same identity ties a request to its reply, so replies echo the
/// identity of the request they answer. An empty identity means "not yet
/// assigned".
///
/// # Examples
///
/// ```
/// use wiregate::fragment::MessageId;
/// let id = MessageId::new("abc123");
/// assert_eq!(id.as_str(), "abc123");
/// assert_eq!(MessageId::generate().as_str().len(), 9);
/// ```
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct MessageId(String);

impl MessageId {
    /// Wrap an existing identity.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self { Self(value.into()) }

    /// Generate a fresh random identity of nine base-36 characters.
    #[must_use]
    pub fn generate() -> Self { Self(random_base36(GENERATED_ID_LEN)) }

    /// Borrow the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str { self.0.as_str() }

    /// Whether no identity has been assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self { Self(value.to_owned()) }
}

/// Produce `len` random lowercase base-36 characters.
pub(crate) fn random_base36(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())]))
        .collect()
}
