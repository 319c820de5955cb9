// [[MISSION-RELAY]]/apps/relay-server/src/runtime.rs
// Purpose: Relay runtime. Owns the event bus, the connection registry and the mission mirror.
// Architecture: Domain Logic Layer
// Dependencies: tokio (broadcast), parking_lot, tokio-util

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::diagnostics::{DiagnosticsLog, Side};
use crate::dispatch::Dispatcher;
use crate::envelope::{Envelope, EventType};
use crate::model::{Mission, StoreConfig};
use crate::observability::Telemetry;
use crate::server::registry::ConnectionRegistry;

pub struct RelayRuntime {
    pub config: ServerConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub telemetry: Arc<Telemetry>,
    pub diagnostics: Arc<DiagnosticsLog>,
    pub event_bus: broadcast::Sender<Envelope>,
    /// Server-side copy of the model, served for the initial bulk load
    mirror: Mutex<Dispatcher>,
    shutdown: CancellationToken,
}

impl RelayRuntime {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let telemetry = Arc::new(Telemetry::new());
        let diagnostics = Arc::new(DiagnosticsLog::new(Side::Server, config.diagnostics_capacity));
        let registry = Arc::new(ConnectionRegistry::new(telemetry.clone(), diagnostics.clone()));
        let (event_bus, _) = broadcast::channel(config.event_bus_capacity.max(1));

        Arc::new(RelayRuntime {
            config,
            registry,
            telemetry,
            diagnostics,
            event_bus,
            mirror: Mutex::new(Dispatcher::new(StoreConfig::default())),
            shutdown: CancellationToken::new(),
        })
    }

    /// Accept an event from the producer. Never waits on observers.
    pub fn publish(&self, envelope: Envelope) -> usize {
        if envelope.event_type.is_control() {
            tracing::debug!(event_type = %envelope.event_type, "Producer sent a control envelope; relaying as-is");
        } else {
            self.mirror.lock().dispatch(envelope.clone());
        }
        // No subscribers just means the pump is not running yet
        self.event_bus.send(envelope).unwrap_or(0)
    }

    pub fn missions(&self) -> Vec<Mission> {
        self.mirror.lock().store().missions()
    }

    /// Start the pump, the reaper and the keep-alive heartbeat.
    pub fn spawn_background(self: &Arc<Self>) {
        let pump = self.clone();
        let rx = self.event_bus.subscribe();
        tokio::spawn(async move { pump.run_pump(rx).await });

        let reaper = self.clone();
        tokio::spawn(async move { reaper.run_reaper().await });

        let heartbeat = self.clone();
        tokio::spawn(async move { heartbeat.run_heartbeat().await });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Event bus -> broadcaster.
    async fn run_pump(&self, mut rx: broadcast::Receiver<Envelope>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(envelope) => {
                        let report = self.registry.broadcast(&envelope);
                        if !report.dropped.is_empty() {
                            tracing::info!(dropped = report.dropped.len(), "Broadcast dropped sessions");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Broadcast pump lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        tracing::info!("Broadcast pump stopped");
    }

    async fn run_reaper(&self) {
        let mut ticker = interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = self.registry.reap(
                        Instant::now(),
                        self.config.liveness_window,
                        self.config.handshake_timeout,
                    );
                    if !reaped.is_empty() {
                        tracing::info!(count = reaped.len(), "Reaped dead sessions");
                    }
                }
            }
        }
    }

    async fn run_heartbeat(&self) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let beat = Envelope::control(EventType::Heartbeat, "relay")
                        .with_field("open_sessions", self.registry.open_count().into());
                    self.registry.broadcast(&beat);
                }
            }
        }
    }
}
