pub mod backoff;
pub mod bootstrap;
pub mod lifecycle;
pub mod manager;
pub mod validation;

pub use backoff::Backoff;
pub use bootstrap::{BootstrapError, HttpMissionSource, MissionSource, StaticMissionSource};
pub use lifecycle::{Lifecycle, Visibility};
pub use manager::{ConnectionManager, ConnectionStatus, ReconnectController, ReconnectHandle};
pub use validation::LatestOnly;
