use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the connection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub connects: u64,
    pub disconnects: u64,
    pub reconnect_attempts: u64,
    pub parse_errors: u64,
    pub dropped_sessions: u64,
    pub degraded_encodes: u64,
    pub broadcasts: u64,
    pub frames_delivered: u64,
}

/// Lock-free counters shared by the registry, the session tasks and the
/// observer's connection manager.
#[derive(Debug, Default)]
pub struct Telemetry {
    connects: AtomicU64,
    disconnects: AtomicU64,
    reconnect_attempts: AtomicU64,
    parse_errors: AtomicU64,
    dropped_sessions: AtomicU64,
    degraded_encodes: AtomicU64,
    broadcasts: AtomicU64,
    frames_delivered: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_session(&self) {
        self.dropped_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded_encode(&self) {
        self.degraded_encodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast(&self, delivered: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.frames_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Metrics {
        Metrics {
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            dropped_sessions: self.dropped_sessions.load(Ordering::Relaxed),
            degraded_encodes: self.degraded_encodes.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
        }
    }
}

/// Install the fmt subscriber. `RUST_LOG` wins over the given defaults.
pub fn init_tracing(defaults: &[&str]) {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in defaults {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("ignoring bad log directive {directive}: {e}"),
        }
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
