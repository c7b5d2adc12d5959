//! Plain configuration values.
//!
//! Every component is configured through builder methods; the structs in this
//! module group the same knobs so a binary can load them from any `serde`
//! source (environment, TOML, JSON). Durations are expressed in milliseconds.

use serde::Deserialize;

use crate::relay::RelayConfig;
use crate::router::RouterConfig;
use crate::router::middleware::RetryConfig;

/// Top-level configuration for a process running the relay and the router.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub router: RouterConfig,
    pub retry: RetryConfig,
}

/// `serde` adapter reading a [`std::time::Duration`] from integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `serde` adapter rejecting a zero count.
pub(crate) fn non_zero<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match usize::deserialize(deserializer)? {
        0 => Err(serde::de::Error::invalid_value(
            serde::de::Unexpected::Unsigned(0),
            &"a positive integer",
        )),
        n => Ok(n),
    }
}
