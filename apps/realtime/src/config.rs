use std::time::Duration;

/// Realtime client configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker WebSocket URL (e.g. `ws://localhost:8081/chat-ws/websocket`).
    pub bus_url: String,
    /// REST API origin (e.g. `http://localhost:8081/api/v1`).
    pub api_url: String,
    /// Bearer token sent in the STOMP CONNECT headers and REST calls.
    pub auth_token: String,
    /// The viewing user's id.
    pub user_id: i64,
    /// How long to wait for CONNECTED after sending CONNECT.
    pub connect_timeout: Duration,
    /// How long `publish_confirmed` waits for a RECEIPT.
    pub receipt_timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// Bounded exponential backoff used by the reconnect supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Attempts before the supervisor gives up and reports persistent failure.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    /// Base delay before the given attempt (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let defaults = BackoffPolicy::default();
        Self {
            bus_url: required_var("BUS_URL"),
            api_url: required_var("API_URL"),
            auth_token: required_var("AUTH_TOKEN"),
            user_id: required_var("USER_ID")
                .parse()
                .unwrap_or_else(|_| panic!("USER_ID must be an integer")),
            connect_timeout: millis_var("CONNECT_TIMEOUT_MS").unwrap_or(Duration::from_secs(5)),
            receipt_timeout: millis_var("RECEIPT_TIMEOUT_MS").unwrap_or(Duration::from_secs(5)),
            backoff: BackoffPolicy {
                initial: millis_var("RECONNECT_INITIAL_MS").unwrap_or(defaults.initial),
                max: millis_var("RECONNECT_MAX_MS").unwrap_or(defaults.max),
                max_attempts: std::env::var("RECONNECT_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.max_attempts),
            },
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn millis_var(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}
