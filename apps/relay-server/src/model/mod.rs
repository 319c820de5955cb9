pub mod cache;
pub mod mission;
pub mod store;

pub use mission::{Mission, MissionPatch, MissionStatus};
pub use store::{Applied, Command, MissionStore, ModelSnapshot, StoreConfig};
