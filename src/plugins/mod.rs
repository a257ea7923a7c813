//! Executor contract and the name → executor registry that routes envelopes.

pub mod http;
pub mod sql;
pub mod version;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::AgentConfig;
use crate::envelope::{Envelope, FrameResponse};
use crate::error::Error;

use http::HttpPlugin;
use sql::SqlPlugin;
use version::VersionPlugin;

/// Uniform contract every backend executor implements.
///
/// `init` loads the executor's static configuration snapshot and may be
/// called again on reload; `handle` processes one envelope; `close` releases
/// whatever the executor holds at shutdown.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    async fn init(&self, config: &AgentConfig) -> anyhow::Result<()>;
    async fn handle(&self, envelope: &Envelope) -> Result<FrameResponse, Error>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// Name → executor table, shared for the process lifetime.
///
/// Mutation only happens at startup and on reload; dispatch takes the read
/// side. A dispatched executor is kept alive through its `Arc` for the whole
/// call, so a concurrent re-registration can never tear it down mid-request.
#[derive(Default)]
pub struct PluginManager {
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
}

impl PluginManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert an executor under its name. Last write wins.
    pub async fn register(&self, plugin: Arc<dyn Plugin>) {
        let name = plugin.name().to_string();
        self.plugins.write().await.insert(name.clone(), plugin);
        info!(plugin = %name, "plugin registered");
    }

    /// Construct, initialize and register the built-in executors. An init
    /// failure is logged and does not prevent registration: the executor can
    /// still be re-initialized on the next config reload.
    pub async fn load_builtin(self: &Arc<Self>, config: &AgentConfig) {
        let builtin: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(HttpPlugin::new(Arc::downgrade(self))),
            Arc::new(VersionPlugin::new()),
            Arc::new(SqlPlugin::new(sql::mysql::MySqlExecutor)),
            Arc::new(SqlPlugin::new(sql::pgsql::PgExecutor)),
            Arc::new(SqlPlugin::new(sql::mssql::MssqlExecutor)),
            Arc::new(SqlPlugin::new(sql::oracledb::OracleExecutor)),
        ];
        for plugin in builtin {
            if let Err(err) = plugin.init(config).await {
                error!(plugin = plugin.name(), %err, "plugin init failed");
            }
            self.register(plugin).await;
        }
    }

    /// Parse raw envelope bytes and route them to the matching executor.
    pub async fn dispatch(&self, raw: &[u8]) -> Result<FrameResponse, Error> {
        let envelope = Envelope::parse(raw)?;
        self.dispatch_envelope(&envelope).await
    }

    /// Route an already-parsed envelope by its resolved plugin name.
    pub async fn dispatch_envelope(&self, envelope: &Envelope) -> Result<FrameResponse, Error> {
        self.handle_with(envelope.plugin_name(), envelope).await
    }

    /// Dispatch to an explicitly named executor (secondary routing).
    pub async fn handle_with(
        &self,
        name: &str,
        envelope: &Envelope,
    ) -> Result<FrameResponse, Error> {
        let plugin = {
            let plugins = self.plugins.read().await;
            plugins
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownPlugin(name.to_string()))?
        };
        plugin.handle(envelope).await
    }

    /// Whether an executor is registered under `name`.
    pub async fn contains(&self, name: &str) -> bool {
        self.plugins.read().await.contains_key(name)
    }

    /// Re-initialize every registered executor with a fresh config snapshot.
    /// Best effort: one failure does not block the rest.
    pub async fn reload_all(&self, config: &AgentConfig) {
        let plugins: Vec<Arc<dyn Plugin>> =
            self.plugins.read().await.values().cloned().collect();
        for plugin in plugins {
            if let Err(err) = plugin.init(config).await {
                error!(plugin = plugin.name(), %err, "plugin reinit failed");
            }
        }
    }

    /// Close every executor. Shutdown proceeds regardless of failures.
    pub async fn close_all(&self) {
        let plugins: Vec<Arc<dyn Plugin>> =
            self.plugins.read().await.values().cloned().collect();
        for plugin in plugins {
            if let Err(err) = plugin.close().await {
                error!(plugin = plugin.name(), %err, "plugin close failed");
            }
        }
    }
}
