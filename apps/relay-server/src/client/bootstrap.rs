// [[MISSION-RELAY]]/apps/relay-server/src/client/bootstrap.rs
// Purpose: Initial bulk load of missions before incremental events apply.
// Architecture: Client Model Layer
// Dependencies: reqwest, async-trait

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::model::Mission;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Snapshot request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Snapshot endpoint returned {0}")]
    Status(reqwest::StatusCode),
}

/// Authoritative source for the mission list.
#[async_trait]
pub trait MissionSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Mission>, BootstrapError>;
}

pub struct HttpMissionSource {
    client: reqwest::Client,
    url: String,
}

impl HttpMissionSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, BootstrapError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl MissionSource for HttpMissionSource {
    async fn load(&self) -> Result<Vec<Mission>, BootstrapError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(BootstrapError::Status(response.status()));
        }
        let missions: Vec<Mission> = response.json().await?;
        tracing::info!(count = missions.len(), url = %self.url, "Loaded mission snapshot");
        Ok(missions)
    }
}

/// Fixed list, for tests and offline runs.
pub struct StaticMissionSource(pub Vec<Mission>);

#[async_trait]
impl MissionSource for StaticMissionSource {
    async fn load(&self) -> Result<Vec<Mission>, BootstrapError> {
        Ok(self.0.clone())
    }
}
