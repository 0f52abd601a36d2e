//! Runtime configuration for replication rounds.

use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

/// Knobs governing a leader's replication fan-out.
///
/// The default values of the fields are gathered from the [`clap`]
/// attributes, so a `Config::default()` is always a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[clap(about, long_about = None)]
pub struct Config {
    /// The timeout in milliseconds for a single append entries request to a
    /// follower. It also bounds how long a follower may stay silent before
    /// the leader stops queueing append entries requests to it and leaves
    /// catch-up to recovery.
    #[clap(long, env = "RAFT_REPLICATE_APPEND_TIMEOUT_MS", default_value = "3000")]
    pub replicate_append_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        // Empty argument list: everything falls back to the clap defaults.
        <Self as Parser>::parse_from(Vec::<&'static str>::new())
    }
}

impl Config {
    /// Validate the configuration, consuming and returning it on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.replicate_append_timeout_ms == 0 {
            return Err(ConfigError::ReplicateAppendTimeoutTooSmall {
                got: self.replicate_append_timeout_ms,
            });
        }
        Ok(self)
    }

    /// The per-request deadline for append entries dispatch.
    pub fn replicate_append_timeout(&self) -> Duration {
        Duration::from_millis(self.replicate_append_timeout_ms)
    }
}
