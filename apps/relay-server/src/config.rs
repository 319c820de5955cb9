use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Relay URL must use ws:// or wss://, got {0}")]
    InvalidUrl(String),
    #[error("Invalid backoff: {0}")]
    InvalidBackoff(String),
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring invalid {}={:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Silence after which an open session is presumed dead
    pub liveness_window: Duration,
    /// Time a session may sit in CONNECTING before `client_ready`
    pub handshake_timeout: Duration,
    /// How often the reaper sweeps for dead sessions
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Frames buffered per session before it is dropped
    pub outbound_queue: usize,
    pub event_bus_capacity: usize,
    pub diagnostics_capacity: usize,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_or("RELAY_PORT", defaults.port),
            liveness_window: env_secs("RELAY_LIVENESS_SECS", defaults.liveness_window),
            handshake_timeout: env_secs("RELAY_HANDSHAKE_SECS", defaults.handshake_timeout),
            sweep_interval: env_secs("RELAY_SWEEP_SECS", defaults.sweep_interval),
            heartbeat_interval: env_secs("RELAY_HEARTBEAT_SECS", defaults.heartbeat_interval),
            outbound_queue: env_or("RELAY_OUTBOUND_QUEUE", defaults.outbound_queue),
            event_bus_capacity: env_or("RELAY_EVENT_BUS", defaults.event_bus_capacity),
            diagnostics_capacity: env_or("RELAY_DIAGNOSTICS_CAPACITY", defaults.diagnostics_capacity),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            liveness_window: Duration::from_secs(45),
            handshake_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(20),
            outbound_queue: 256,
            event_bus_capacity: 1024,
            diagnostics_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Delay is scaled by a random factor in `[1 - jitter, 1 + jitter]`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 1.5,
            max_delay: Duration::from_secs(10),
            jitter: 0.25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. ws://localhost:3000/ws/events
    pub url: String,
    /// HTTP endpoint serving the mission snapshot for the initial load
    pub snapshot_url: Option<String>,
    /// Identity sent in `client_ready`
    pub page_id: String,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
    /// An open channel that saw a message within this window counts as healthy
    pub health_window: Duration,
    pub backoff: BackoffConfig,
    /// Consecutive failures before the status flips to disconnected
    pub disconnected_after: u32,
    pub feed_capacity: usize,
    pub log_capacity: usize,
    pub diagnostics_capacity: usize,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let backoff = BackoffConfig {
            base: Duration::from_millis(env_or("RELAY_BACKOFF_BASE_MS", defaults.backoff.base.as_millis() as u64)),
            factor: env_or("RELAY_BACKOFF_FACTOR", defaults.backoff.factor),
            max_delay: Duration::from_millis(env_or(
                "RELAY_BACKOFF_MAX_MS",
                defaults.backoff.max_delay.as_millis() as u64,
            )),
            jitter: env_or("RELAY_BACKOFF_JITTER", defaults.backoff.jitter),
        };

        Self {
            url: env::var("RELAY_URL").unwrap_or(defaults.url),
            snapshot_url: env::var("RELAY_SNAPSHOT_URL").ok().or(defaults.snapshot_url),
            page_id: env::var("RELAY_PAGE_ID").unwrap_or(defaults.page_id),
            ping_interval: env_secs("RELAY_PING_SECS", defaults.ping_interval),
            connect_timeout: env_secs("RELAY_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            health_window: env_secs("RELAY_HEALTH_WINDOW_SECS", defaults.health_window),
            backoff,
            disconnected_after: env_or("RELAY_DISCONNECTED_AFTER", defaults.disconnected_after),
            feed_capacity: env_or("RELAY_FEED_CAPACITY", defaults.feed_capacity),
            log_capacity: env_or("RELAY_LOG_CAPACITY", defaults.log_capacity),
            diagnostics_capacity: env_or("RELAY_DIAGNOSTICS_CAPACITY", defaults.diagnostics_capacity),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(self.url.clone()));
        }
        let b = &self.backoff;
        if b.base.is_zero() {
            return Err(ConfigError::InvalidBackoff("base delay must be positive".into()));
        }
        if b.factor < 1.0 || !b.factor.is_finite() {
            return Err(ConfigError::InvalidBackoff(format!("factor {} must be >= 1", b.factor)));
        }
        if b.max_delay < b.base {
            return Err(ConfigError::InvalidBackoff("max delay below base delay".into()));
        }
        if !(0.0..1.0).contains(&b.jitter) {
            return Err(ConfigError::InvalidBackoff(format!("jitter {} outside [0, 1)", b.jitter)));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/ws/events".to_string(),
            snapshot_url: Some("http://127.0.0.1:3000/missions".to_string()),
            page_id: "observer".to_string(),
            ping_interval: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            health_window: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            disconnected_after: 8,
            feed_capacity: 200,
            log_capacity: 50,
            diagnostics_capacity: 200,
        }
    }
}
