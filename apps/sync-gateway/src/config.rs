/// Sync gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the WebSocket server binds to.
    pub port: u16,
    /// Maximum connects per source address inside one window.
    pub connect_limit: u64,
    /// Length of the per-address connect window in seconds.
    pub connect_window_secs: u64,
    /// Interval between active-user presence flushes in seconds.
    pub presence_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables, with defaults for
    /// everything — the gateway has no required settings of its own.
    pub fn from_env() -> Self {
        Self {
            port: var_or("PORT", 3010),
            connect_limit: var_or("CONNECT_LIMIT", 120),
            connect_window_secs: var_or("CONNECT_WINDOW_SECS", 10),
            presence_interval_secs: var_or("PRESENCE_INTERVAL_SECS", 60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3010,
            connect_limit: 120,
            connect_window_secs: 10,
            presence_interval_secs: 60,
        }
    }
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
