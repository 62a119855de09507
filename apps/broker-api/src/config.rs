use std::path::PathBuf;
use std::time::Duration;

/// Broker process configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Path to the broker settings JSON. Built-in defaults are used when unset.
    pub settings_path: Option<PathBuf>,
    /// Upper bound for a parked long-poll request.
    pub max_poll_wait: Duration,
    /// How long a streaming session may stay disconnected before it is swept.
    pub disconnect_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; malformed numbers fall back to defaults.
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8400),
            settings_path: optional_var("BROKER_CONFIG").map(PathBuf::from),
            max_poll_wait: Duration::from_millis(
                optional_var("BROKER_POLL_WAIT_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20_000),
            ),
            disconnect_grace: Duration::from_secs(
                optional_var("BROKER_DISCONNECT_GRACE_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8400,
            settings_path: None,
            max_poll_wait: Duration::from_millis(20_000),
            disconnect_grace: Duration::from_secs(30),
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}
