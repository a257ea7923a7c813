//! Static agent configuration: per-dialect connection descriptors and
//! per-dialect auth flags, loaded from a TOML file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::plugins::sql::ConnectionBody;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub plugins: PluginSections,
    pub auth: AuthSections,
}

/// Named connection descriptors, one list per SQL dialect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSections {
    pub mysql: Vec<ConnectionBody>,
    pub pgsql: Vec<ConnectionBody>,
    pub mssql: Vec<ConnectionBody>,
    pub oracledb: Vec<ConnectionBody>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSections {
    pub mysql: DialectAuth,
    pub pgsql: DialectAuth,
    pub mssql: DialectAuth,
    pub oracledb: DialectAuth,
}

/// Per-dialect execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialectAuth {
    /// Accept connection details supplied by the caller instead of requiring
    /// a locally configured descriptor.
    pub allow_remote: bool,
    /// Keep binary column values as bytes (base64 in the JSON row) instead of
    /// decoding them to text.
    pub value_as_bytes: bool,
    /// Upper bound on a single query, connection setup included.
    pub query_timeout_secs: u64,
}

impl Default for DialectAuth {
    fn default() -> Self {
        Self {
            allow_remote: false,
            value_as_bytes: false,
            query_timeout_secs: 30,
        }
    }
}

impl AgentConfig {
    /// Load from `path`. A missing file yields the default (empty) config so
    /// the agent can start before it has been provisioned.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pluxy")
            .join("config.toml")
    }

    /// Connection descriptors registered under a dialect section name.
    pub fn connections(&self, dialect: &str) -> &[ConnectionBody] {
        match dialect {
            "mysql" => &self.plugins.mysql,
            "pgsql" => &self.plugins.pgsql,
            "mssql" => &self.plugins.mssql,
            "oracledb" => &self.plugins.oracledb,
            _ => &[],
        }
    }

    /// Auth flags for a dialect section name; unknown sections get defaults.
    pub fn auth(&self, dialect: &str) -> DialectAuth {
        match dialect {
            "mysql" => self.auth.mysql.clone(),
            "pgsql" => self.auth.pgsql.clone(),
            "mssql" => self.auth.mssql.clone(),
            "oracledb" => self.auth.oracledb.clone(),
            _ => DialectAuth::default(),
        }
    }
}
