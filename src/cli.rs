//! Command line interface for the `wiregate` binary.

use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use wiregate::config::{
    ConfigError,
    DEFAULT_MAX_BUFFERED_FRAGMENTS,
    DEFAULT_MAX_FRAGMENT_SIZE,
    GatewayConfig,
};

/// Command line arguments for the `wiregate` binary.
#[derive(Debug, Parser)]
#[command(name = "wiregate", version, about = "Fragmenting request/reply gateway")]
pub struct Cli {
    /// Address to accept peer connections on.
    #[arg(short, long, env = "WIREGATE_LISTEN", default_value = "127.0.0.1:7878")]
    pub listen: SocketAddr,

    /// Maximum characters carried by one fragment.
    #[arg(long, env = "WIREGATE_MAX_FRAGMENT_SIZE", default_value_t = DEFAULT_MAX_FRAGMENT_SIZE)]
    pub max_fragment_size: usize,

    /// Ceiling on fragments buffered for reassembly per session.
    #[arg(
        long,
        env = "WIREGATE_MAX_BUFFERED_FRAGMENTS",
        default_value_t = DEFAULT_MAX_BUFFERED_FRAGMENTS
    )]
    pub max_buffered_fragments: usize,

    /// Milliseconds to wait before requeueing a failed delivery.
    #[arg(long, env = "WIREGATE_REQUEUE_DELAY_MS", default_value_t = 1000)]
    pub requeue_delay_ms: u64,

    /// Evict partial messages older than this many milliseconds.
    #[arg(long, env = "WIREGATE_REASSEMBLY_TIMEOUT_MS")]
    pub reassembly_timeout_ms: Option<u64>,

    /// Fail requests unanswered after this many milliseconds.
    #[arg(long, env = "WIREGATE_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,
}

impl Cli {
    /// Validate the flags into a [`GatewayConfig`].
    pub fn gateway_config(&self) -> Result<GatewayConfig, ConfigError> {
        GatewayConfig::builder()
            .max_fragment_size(self.max_fragment_size)
            .max_buffered_fragments(self.max_buffered_fragments)
            .requeue_delay(Duration::from_millis(self.requeue_delay_ms))
            .reassembly_timeout(self.reassembly_timeout_ms.map(Duration::from_millis))
            .request_timeout(self.request_timeout_ms.map(Duration::from_millis))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn defaults_match_library_config() {
        let cli = Cli::parse_from(["wiregate"]);
        let config = cli.gateway_config().expect("defaults are valid");
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn parses_limits_and_timeouts() {
        let cli = Cli::parse_from([
            "wiregate",
            "--listen",
            "0.0.0.0:9000",
            "--max-fragment-size",
            "64",
            "--request-timeout-ms",
            "250",
        ]);
        assert_eq!(cli.listen.port(), 9000);
        let config = cli.gateway_config().expect("valid config");
        assert_eq!(config.max_fragment_size.get(), 64);
        assert_eq!(config.request_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.reassembly_timeout, None);
    }

    #[test]
    fn zero_fragment_size_is_rejected() {
        let cli = Cli::parse_from(["wiregate", "--max-fragment-size", "0"]);
        assert_eq!(cli.gateway_config(), Err(ConfigError::ZeroFragmentSize));
    }
}
