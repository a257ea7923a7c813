//! Stateless executor reporting the agent name and supported protocol version.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::AgentConfig;
use crate::envelope::{Envelope, FrameResponse, VERSION_PLUGIN};
use crate::error::Error;

use super::Plugin;

#[derive(Debug, Clone, Serialize)]
pub struct VersionPlugin {
    pub name: &'static str,
    pub protocol_version: &'static str,
}

impl VersionPlugin {
    pub fn new() -> Self {
        Self {
            name: VERSION_PLUGIN,
            protocol_version: "2.0",
        }
    }
}

impl Default for VersionPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for VersionPlugin {
    fn name(&self) -> &str {
        self.name
    }

    async fn init(&self, _config: &AgentConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle(&self, _envelope: &Envelope) -> Result<FrameResponse, Error> {
        let descriptor = serde_json::to_value(self).unwrap_or(Value::Null);
        Ok(FrameResponse::success(descriptor))
    }

    async fn close(&self) -> anyhow::Result<()> {
        info!(plugin = self.name, "plugin closed");
        Ok(())
    }
}
