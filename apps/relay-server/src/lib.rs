// [[MISSION-RELAY]]/apps/relay-server/src/lib.rs
// Purpose: Real-time event relay for the mission dashboard. Server broadcaster,
//          resilient observer client and the shared reconciling model.
// Architecture: Crate root

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod envelope;
pub mod model;
pub mod observability;
pub mod ring;
pub mod runtime;
pub mod safety;
pub mod server;
