//! Gateway configuration.
//!
//! [`GatewayConfig`] carries the policy values shared by every session:
//! fragment size, the reassembly ceiling and the delays used by the retry
//! protocol. Values can be deserialized (durations as milliseconds) or
//! assembled through [`GatewayConfigBuilder`], which validates them.

use std::{num::NonZeroUsize, time::Duration};

use serde::Deserialize;
use thiserror::Error;

/// Default maximum characters per fragment.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 500;
/// Default ceiling on fragments buffered for reassembly per session.
pub const DEFAULT_MAX_BUFFERED_FRAGMENTS: usize = 25_000;
/// Default pause before a failed delivery is negatively acknowledged.
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_millis(1000);

/// Errors returned when building a [`GatewayConfig`].
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The fragment size was zero.
    #[error("max fragment size must be at least 1")]
    ZeroFragmentSize,
    /// The reassembly ceiling was zero.
    #[error("max buffered fragments must be at least 1")]
    ZeroBufferCeiling,
    /// An optional timeout was set to zero.
    #[error("{0} must be greater than zero when set")]
    ZeroTimeout(&'static str),
}

/// Policy values shared by all sessions of a gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Maximum characters carried by one fragment.
    pub max_fragment_size: NonZeroUsize,
    /// Ceiling on fragments buffered for reassembly across all identities.
    pub max_buffered_fragments: NonZeroUsize,
    /// Delay before a failed queue delivery is negatively acknowledged.
    #[serde(rename = "requeue_delay_ms", with = "millis")]
    pub requeue_delay: Duration,
    /// Age after which incomplete messages are evicted, if set.
    #[serde(rename = "reassembly_timeout_ms", with = "opt_millis")]
    pub reassembly_timeout: Option<Duration>,
    /// Time a request may wait for its reply, if set.
    #[serde(rename = "request_timeout_ms", with = "opt_millis")]
    pub request_timeout: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: NonZeroUsize::new(DEFAULT_MAX_FRAGMENT_SIZE)
                .unwrap_or(NonZeroUsize::MIN),
            max_buffered_fragments: NonZeroUsize::new(DEFAULT_MAX_BUFFERED_FRAGMENTS)
                .unwrap_or(NonZeroUsize::MIN),
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            reassembly_timeout: None,
            request_timeout: None,
        }
    }
}

impl GatewayConfig {
    /// Start building a configuration from the defaults.
    #[must_use]
    pub fn builder() -> GatewayConfigBuilder { GatewayConfigBuilder::default() }
}

/// Builder for [`GatewayConfig`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use wiregate::config::GatewayConfig;
///
/// let config = GatewayConfig::builder()
///     .max_fragment_size(256)
///     .requeue_delay(Duration::from_millis(250))
///     .build()
///     .expect("valid configuration");
/// assert_eq!(config.max_fragment_size.get(), 256);
/// ```
#[derive(Clone, Debug)]
pub struct GatewayConfigBuilder {
    max_fragment_size: usize,
    max_buffered_fragments: usize,
    requeue_delay: Duration,
    reassembly_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl Default for GatewayConfigBuilder {
    fn default() -> Self {
        Self {
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            max_buffered_fragments: DEFAULT_MAX_BUFFERED_FRAGMENTS,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            reassembly_timeout: None,
            request_timeout: None,
        }
    }
}

impl GatewayConfigBuilder {
    #[must_use]
    pub fn max_fragment_size(mut self, size: usize) -> Self {
        self.max_fragment_size = size;
        self
    }

    #[must_use]
    pub fn max_buffered_fragments(mut self, ceiling: usize) -> Self {
        self.max_buffered_fragments = ceiling;
        self
    }

    #[must_use]
    pub fn requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    #[must_use]
    pub fn reassembly_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Validate the settings and produce a [`GatewayConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a size is zero or an optional timeout is
    /// set to zero.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        let max_fragment_size =
            NonZeroUsize::new(self.max_fragment_size).ok_or(ConfigError::ZeroFragmentSize)?;
        let max_buffered_fragments =
            NonZeroUsize::new(self.max_buffered_fragments).ok_or(ConfigError::ZeroBufferCeiling)?;
        if self.reassembly_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroTimeout("reassembly timeout"));
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroTimeout("request timeout"));
        }
        Ok(GatewayConfig {
            max_fragment_size,
            max_buffered_fragments,
            requeue_delay: self.requeue_delay,
            reassembly_timeout: self.reassembly_timeout,
            request_timeout: self.request_timeout,
        })
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults_match_gateway_policy() {
        let config = GatewayConfig::default();
        assert_eq!(config.max_fragment_size.get(), 500);
        assert_eq!(config.max_buffered_fragments.get(), 25_000);
        assert_eq!(config.requeue_delay, Duration::from_secs(1));
        assert!(config.request_timeout.is_none());
        assert_eq!(GatewayConfig::builder().build(), Ok(config));
    }

    #[rstest]
    #[case(GatewayConfig::builder().max_fragment_size(0), ConfigError::ZeroFragmentSize)]
    #[case(GatewayConfig::builder().max_buffered_fragments(0), ConfigError::ZeroBufferCeiling)]
    #[case(
        GatewayConfig::builder().request_timeout(Some(Duration::ZERO)),
        ConfigError::ZeroTimeout("request timeout")
    )]
    fn rejects_invalid_values(#[case] builder: GatewayConfigBuilder, #[case] expected: ConfigError) {
        assert_eq!(builder.build(), Err(expected));
    }

    #[test]
    fn deserializes_millisecond_fields() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"max_fragment_size": 64, "requeue_delay_ms": 250, "request_timeout_ms": 5000}"#,
        )
        .expect("valid config");

        assert_eq!(config.max_fragment_size.get(), 64);
        assert_eq!(config.max_buffered_fragments.get(), 25_000);
        assert_eq!(config.requeue_delay, Duration::from_millis(250));
        assert_eq!(config.request_timeout, Some(Duration::from_secs(5)));
        assert!(config.reassembly_timeout.is_none());
    }
}
