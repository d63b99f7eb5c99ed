use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// A device is reported offline once its heartbeat is older than this.
    pub stale_threshold: Duration,
    /// How often the presence sweep evicts stale agents.
    pub sweep_interval: Duration,
    /// Per-transport keep-alive ping cadence.
    pub ping_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PIER_RELAY_PORT", 8080),
            stale_threshold: Duration::from_secs(env_parse("PIER_STALE_THRESHOLD_SECS", 90)),
            sweep_interval: Duration::from_secs(env_parse("PIER_SWEEP_INTERVAL_SECS", 30)),
            ping_interval: Duration::from_secs(env_parse("PIER_PING_INTERVAL_SECS", 25)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            stale_threshold: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
            ping_interval: Duration::from_secs(25),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
