// [[MISSION-RELAY]]/apps/relay-server/src/bin/observer.rs
// Purpose: Headless dashboard observer. Keeps a live mission model in sync with the relay.
// Architecture: Application Boot
// Dependencies: Tokio, mission_relay client

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use mission_relay::client::{
    BootstrapError, ConnectionManager, ConnectionStatus, HttpMissionSource, LatestOnly, Lifecycle, MissionSource,
};
use mission_relay::config::ClientConfig;
use mission_relay::dispatch::{describe_mission, DispatchOutcome, Dispatcher};
use mission_relay::model::{Applied, Mission, StoreConfig};
use mission_relay::observability::init_tracing;

type Snapshot = Result<Vec<Mission>, BootstrapError>;

async fn next_snapshot(pending: &mut Option<oneshot::Receiver<Snapshot>>) -> Option<Snapshot> {
    match pending.as_mut() {
        // A superseded load closes its receiver without a value
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

fn print_summary(dispatcher: &Dispatcher, status: &ConnectionStatus) {
    let store = dispatcher.store();
    println!(
        "[{:?}] missions={} activity={} live={}",
        status,
        store.mission_count(),
        store.agent_activity().len(),
        store.live_stream().len(),
    );
    for mission in store.missions().iter().take(5) {
        println!("  {}", describe_mission(mission));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(&["mission_relay=info"]);

    let config = ClientConfig::from_env();
    config.validate().context("Invalid observer configuration")?;

    let source: Option<Arc<dyn MissionSource>> = match &config.snapshot_url {
        Some(url) => {
            let http: Arc<dyn MissionSource> = Arc::new(HttpMissionSource::new(url.clone(), config.connect_timeout)?);
            Some(http)
        }
        None => None,
    };

    let mut dispatcher = Dispatcher::new(StoreConfig {
        activity_capacity: config.feed_capacity,
        log_capacity: config.log_capacity,
        live_capacity: config.feed_capacity,
        ..StoreConfig::default()
    });

    let lifecycle = Arc::new(Lifecycle::new());
    let (manager, mut events) = ConnectionManager::new(config.clone(), lifecycle.clone());
    let mut status = manager.status();
    let diagnostics = manager.diagnostics();
    let manager_task = tokio::spawn(manager.run());

    let unload = lifecycle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, closing channel");
            unload.on_unload();
        }
    });

    let resync = LatestOnly::new(Duration::from_millis(250));
    let mut pending: Option<oneshot::Receiver<Snapshot>> = None;

    loop {
        tokio::select! {
            envelope = events.recv() => {
                let Some(envelope) = envelope else { break };
                match dispatcher.dispatch(envelope) {
                    DispatchOutcome::Applied(Applied::Changed) => print_summary(&dispatcher, &status.borrow()),
                    DispatchOutcome::Rejected(reason) => tracing::warn!("Envelope rejected: {}", reason),
                    _ => {}
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current == ConnectionStatus::Connected {
                    // Bulk load after every (re)connect; the newest request wins
                    if let Some(source) = &source {
                        let source = source.clone();
                        pending = Some(resync.submit(move |_| async move { source.load().await }));
                    }
                }
                if current == ConnectionStatus::Stopped {
                    resync.cancel();
                }
                print_summary(&dispatcher, &current);
            }
            snapshot = next_snapshot(&mut pending) => {
                pending = None;
                match snapshot {
                    Some(Ok(missions)) => {
                        let count = missions.len();
                        if dispatcher.load(missions) == Applied::Changed {
                            tracing::info!(count, "Applied mission snapshot");
                            print_summary(&dispatcher, &status.borrow());
                        }
                    }
                    Some(Err(e)) => tracing::warn!("Snapshot load failed: {}", e),
                    None => {}
                }
            }
        }
    }

    manager_task.await.context("Connection manager panicked")?;

    let abnormal = diagnostics
        .recent(usize::MAX)
        .into_iter()
        .filter(|record| record.kind.is_abnormal_close())
        .count();
    tracing::info!(abnormal_closes = abnormal, "Observer stopped");
    Ok(())
}
