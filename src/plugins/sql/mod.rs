//! Shared SQL executor plumbing: the connection descriptor, the JSON-safe
//! result representation, the config-key merge rules and the generic plugin
//! wrapper each dialect executor plugs into.

pub mod mssql;
pub mod mysql;
pub mod oracledb;
pub mod pgsql;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::{AgentConfig, DialectAuth};
use crate::envelope::{Envelope, FrameResponse};
use crate::error::Error;

use super::Plugin;

/// Port number that accepts both a JSON number and a numeric string on the
/// wire (legacy callers send either).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlexPort(u16);

impl FlexPort {
    pub fn get(self) -> u16 {
        self.0
    }
}

impl From<u16> for FlexPort {
    fn from(port: u16) -> Self {
        Self(port)
    }
}

impl<'de> Deserialize<'de> for FlexPort {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u16),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(FlexPort(n)),
            Raw::Str(s) => s
                .trim()
                .parse::<u16>()
                .map(FlexPort)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Backend connection descriptor, partially supplied by the caller and
/// completed from a locally configured descriptor selected by `config_key`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionBody {
    pub host: String,
    pub port: FlexPort,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Oracle service name; ignored by the other dialects.
    #[serde(alias = "serviceName")]
    pub service_name: String,
    /// Oracle SID; takes precedence over `service_name` when set.
    #[serde(alias = "SID")]
    pub sid: String,
    pub sql: String,
    #[serde(alias = "configKey")]
    pub config_key: String,
    /// v1 envelopes carry the SQL text inside this map instead of `sql`.
    #[serde(alias = "configParams")]
    pub config_params: HashMap<String, String>,
}

impl ConnectionBody {
    /// Fold the v1 `configParams.sql` entry into `sql` when `sql` is empty.
    pub fn absorb_config_params(&mut self) {
        if self.sql.is_empty() {
            if let Some(sql) = self.config_params.get("sql") {
                self.sql = sql.clone();
            }
        }
    }

    /// Overwrite connection fields from a locally configured descriptor.
    /// The caller's non-empty SQL text always wins.
    pub fn complete_from(&mut self, local: &ConnectionBody) {
        self.host = local.host.clone();
        self.port = local.port;
        self.user = local.user.clone();
        self.password = local.password.clone();
        self.database = local.database.clone();
        self.service_name = local.service_name.clone();
        self.sid = local.sid.clone();
        if self.sql.is_empty() {
            self.sql = local.sql.clone();
        }
    }
}

/// Apply the allow-remote / config-key policy to a caller-supplied
/// descriptor.
///
/// An empty key with remote configuration enabled passes the descriptor
/// through untouched; anything else requires a local descriptor registered
/// under the key, which completes the caller's descriptor.
pub fn resolve_body(
    mut remote: ConnectionBody,
    allow_remote: bool,
    locals: &[ConnectionBody],
) -> Result<ConnectionBody, Error> {
    if remote.config_key.is_empty() && allow_remote {
        return Ok(remote);
    }
    let local = locals
        .iter()
        .find(|c| c.config_key == remote.config_key)
        .ok_or_else(|| Error::ConfigNotFound(remote.config_key.clone()))?;
    remote.complete_from(local);
    Ok(remote)
}

/// Normalized query outcome. Backend failures land in `message` rather than
/// failing the handle call; callers check the `"success"` sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub result: Vec<Map<String, Value>>,
    pub columns: Vec<String>,
    pub message: String,
}

impl QueryResult {
    pub const SUCCESS: &'static str = "success";

    pub fn success(columns: Vec<String>, result: Vec<Map<String, Value>>) -> Self {
        Self {
            result,
            columns,
            message: String::from(Self::SUCCESS),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            result: Vec::new(),
            columns: Vec::new(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.message == Self::SUCCESS
    }
}

/// One normalized column value on its way into a JSON row.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(Value),
}

impl CellValue {
    /// Convert into a JSON-safe scalar. Binary values become base64 when
    /// `value_as_bytes` is set, lossy UTF-8 text otherwise.
    pub fn into_json(self, value_as_bytes: bool) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(b),
            CellValue::Int(i) => Value::Number(i.into()),
            CellValue::Float(f) => Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(f.to_string())),
            CellValue::Text(s) => Value::String(s),
            CellValue::Bytes(b) => {
                if value_as_bytes {
                    Value::String(BASE64.encode(b))
                } else {
                    Value::String(String::from_utf8_lossy(&b).into_owned())
                }
            }
            CellValue::Date(d) => Value::String(d.to_string()),
            CellValue::Time(t) => Value::String(t.to_string()),
            CellValue::DateTime(dt) => Value::String(dt.to_string()),
            CellValue::TimestampTz(dt) => Value::String(dt.to_rfc3339()),
            CellValue::Json(v) => v,
        }
    }
}

/// Build row maps from decoded cells. Every map carries every column: a
/// missing cell becomes a JSON null rather than a dropped key.
pub fn rows_to_maps(
    columns: &[String],
    rows: Vec<Vec<CellValue>>,
    value_as_bytes: bool,
) -> Vec<Map<String, Value>> {
    rows.into_iter()
        .map(|row| {
            let mut cells = row.into_iter();
            columns
                .iter()
                .map(|col| {
                    let value = cells
                        .next()
                        .map(|c| c.into_json(value_as_bytes))
                        .unwrap_or(Value::Null);
                    (col.clone(), value)
                })
                .collect()
        })
        .collect()
}

/// Decoding options resolved from the dialect's auth config.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    pub value_as_bytes: bool,
}

/// Dialect-specific half of a SQL plugin: connection-string construction and
/// column decoding. Failures are embedded in the returned `QueryResult`.
#[async_trait]
pub trait SqlExecutor: Send + Sync + 'static {
    /// Config section name (`plugins.<dialect>` / `auth.<dialect>`).
    fn dialect(&self) -> &'static str;
    /// Name the plugin registers under.
    fn plugin_name(&self) -> &'static str;
    /// Open a fresh connection, run the SQL verbatim, normalize the rows and
    /// close the connection.
    async fn execute(&self, body: &ConnectionBody, opts: &ExecuteOptions) -> QueryResult;
}

#[derive(Debug, Clone, Default)]
struct SqlState {
    connections: Vec<ConnectionBody>,
    auth: DialectAuth,
}

/// Generic executor-contract implementation shared by the four dialects:
/// config loading, descriptor resolution, timeout enforcement and result
/// framing.
pub struct SqlPlugin<E: SqlExecutor> {
    executor: E,
    state: RwLock<SqlState>,
}

impl<E: SqlExecutor> SqlPlugin<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            state: RwLock::new(SqlState::default()),
        }
    }
}

#[async_trait]
impl<E: SqlExecutor> Plugin for SqlPlugin<E> {
    fn name(&self) -> &str {
        self.executor.plugin_name()
    }

    async fn init(&self, config: &AgentConfig) -> anyhow::Result<()> {
        let dialect = self.executor.dialect();
        let state = SqlState {
            connections: config.connections(dialect).to_vec(),
            auth: config.auth(dialect),
        };
        info!(
            plugin = self.executor.plugin_name(),
            configs = state.connections.len(),
            allow_remote = state.auth.allow_remote,
            value_as_bytes = state.auth.value_as_bytes,
            "plugin initialized"
        );
        *self.state.write().await = state;
        Ok(())
    }

    async fn handle(&self, envelope: &Envelope) -> Result<FrameResponse, Error> {
        let mut remote: ConnectionBody = envelope.decode_payload()?;
        remote.absorb_config_params();

        let state = self.state.read().await.clone();
        let body = resolve_body(remote, state.auth.allow_remote, &state.connections)?;
        let opts = ExecuteOptions {
            value_as_bytes: state.auth.value_as_bytes,
        };
        let deadline = Duration::from_secs(state.auth.query_timeout_secs.max(1));

        let started = Instant::now();
        let result = match tokio::time::timeout(deadline, self.executor.execute(&body, &opts)).await
        {
            Ok(result) => result,
            Err(_) => QueryResult::failure(format!(
                "query timed out after {}s",
                deadline.as_secs()
            )),
        };
        let cost = started.elapsed();
        if result.is_success() {
            info!(plugin = self.executor.plugin_name(), cost = ?cost, "sql query finished");
        } else {
            error!(
                plugin = self.executor.plugin_name(),
                cost = ?cost,
                message = %result.message,
                "sql query failed"
            );
        }

        Ok(FrameResponse::success(
            serde_json::to_value(&result).unwrap_or(Value::Null),
        ))
    }

    async fn close(&self) -> anyhow::Result<()> {
        info!(plugin = self.executor.plugin_name(), "plugin closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local(config_key: &str, sql: &str) -> ConnectionBody {
        ConnectionBody {
            host: "db.internal".into(),
            port: 5432.into(),
            user: "svc".into(),
            password: "secret".into(),
            database: "app".into(),
            sql: sql.into(),
            config_key: config_key.into(),
            ..Default::default()
        }
    }

    // --- FlexPort ---

    #[test]
    fn test_flex_port_from_number_and_string() {
        #[derive(Deserialize)]
        struct P {
            port: FlexPort,
        }
        let p: P = serde_json::from_value(json!({"port": 3306})).unwrap();
        assert_eq!(p.port.get(), 3306);
        let p: P = serde_json::from_value(json!({"port": "3306"})).unwrap();
        assert_eq!(p.port.get(), 3306);
        assert!(serde_json::from_value::<P>(json!({"port": "not-a-port"})).is_err());
    }

    // --- descriptor decoding ---

    #[test]
    fn test_body_accepts_both_config_key_spellings() {
        let a: ConnectionBody = serde_json::from_value(json!({"configKey": "k"})).unwrap();
        let b: ConnectionBody = serde_json::from_value(json!({"config_key": "k"})).unwrap();
        assert_eq!(a.config_key, "k");
        assert_eq!(a, b);
    }

    #[test]
    fn test_absorb_config_params() {
        let mut body: ConnectionBody = serde_json::from_value(json!({
            "configKey": "default",
            "configParams": {"sql": "SELECT 1"}
        }))
        .unwrap();
        body.absorb_config_params();
        assert_eq!(body.sql, "SELECT 1");

        // explicit sql wins over configParams
        let mut body: ConnectionBody = serde_json::from_value(json!({
            "sql": "SELECT 2",
            "configParams": {"sql": "SELECT 1"}
        }))
        .unwrap();
        body.absorb_config_params();
        assert_eq!(body.sql, "SELECT 2");
    }

    // --- merge / resolve policy ---

    #[test]
    fn test_merge_overwrites_connection_fields() {
        let mut caller = ConnectionBody {
            host: "attacker.example".into(),
            sql: "SELECT caller".into(),
            config_key: "default".into(),
            ..Default::default()
        };
        caller.complete_from(&local("default", ""));
        assert_eq!(caller.host, "db.internal");
        assert_eq!(caller.port.get(), 5432);
        assert_eq!(caller.user, "svc");
        assert_eq!(caller.database, "app");
        // caller's non-empty SQL wins
        assert_eq!(caller.sql, "SELECT caller");
    }

    #[test]
    fn test_merge_uses_local_sql_when_caller_empty() {
        let mut caller = ConnectionBody {
            config_key: "default".into(),
            ..Default::default()
        };
        caller.complete_from(&local("default", "SELECT local"));
        assert_eq!(caller.sql, "SELECT local");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let source = local("default", "SELECT local");
        let mut once = ConnectionBody {
            sql: "SELECT caller".into(),
            config_key: "default".into(),
            ..Default::default()
        };
        once.complete_from(&source);
        let mut twice = once.clone();
        twice.complete_from(&source);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_resolve_empty_key_remote_allowed_passes_through() {
        let remote = ConnectionBody {
            host: "caller.example".into(),
            sql: "SELECT 1".into(),
            ..Default::default()
        };
        let resolved = resolve_body(remote.clone(), true, &[local("default", "")]).unwrap();
        assert_eq!(resolved, remote);
    }

    #[test]
    fn test_resolve_empty_key_remote_forbidden_fails() {
        let remote = ConnectionBody {
            host: "caller.example".into(),
            user: "root".into(),
            sql: "SELECT 1".into(),
            ..Default::default()
        };
        let err = resolve_body(remote, false, &[local("default", "")]).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(ref key) if key.is_empty()));
    }

    #[test]
    fn test_resolve_missing_key_fails() {
        let remote = ConnectionBody {
            config_key: "missing".into(),
            ..Default::default()
        };
        let err = resolve_body(remote, true, &[local("default", "")]).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(ref key) if key == "missing"));
    }

    // --- CellValue / row assembly ---

    #[test]
    fn test_cell_value_json_scalars() {
        assert_eq!(CellValue::Null.into_json(false), Value::Null);
        assert_eq!(CellValue::Bool(true).into_json(false), json!(true));
        assert_eq!(CellValue::Int(-7).into_json(false), json!(-7));
        assert_eq!(CellValue::Float(1.5).into_json(false), json!(1.5));
        assert_eq!(CellValue::Text("x".into()).into_json(false), json!("x"));
        assert_eq!(
            CellValue::Json(json!({"a": 1})).into_json(false),
            json!({"a": 1})
        );
    }

    #[test]
    fn test_cell_value_nan_degrades_to_string() {
        assert_eq!(
            CellValue::Float(f64::NAN).into_json(false),
            json!("NaN")
        );
    }

    #[test]
    fn test_cell_value_bytes_modes() {
        let raw = vec![0x68, 0x69]; // "hi"
        assert_eq!(CellValue::Bytes(raw.clone()).into_json(false), json!("hi"));
        assert_eq!(CellValue::Bytes(raw).into_json(true), json!("aGk="));
    }

    #[test]
    fn test_cell_value_temporal() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(CellValue::Date(d).into_json(false), json!("2024-03-09"));
        let dt = d.and_hms_opt(12, 30, 5).unwrap();
        assert_eq!(
            CellValue::DateTime(dt).into_json(false),
            json!("2024-03-09 12:30:05")
        );
    }

    #[test]
    fn test_rows_to_maps_never_drops_columns() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let rows = vec![
            vec![CellValue::Int(1), CellValue::Text("a".into())],
            vec![CellValue::Int(2), CellValue::Null],
            vec![CellValue::Int(3)], // short row still gets every key
        ];
        let maps = rows_to_maps(&columns, rows, false);
        for map in &maps {
            assert_eq!(map.len(), columns.len());
            for col in &columns {
                assert!(map.contains_key(col));
            }
        }
        assert_eq!(maps[1]["name"], Value::Null);
        assert_eq!(maps[2]["name"], Value::Null);
    }

    // --- generic plugin behavior ---

    struct StubExecutor {
        result: QueryResult,
    }

    #[async_trait]
    impl SqlExecutor for StubExecutor {
        fn dialect(&self) -> &'static str {
            "mysql"
        }

        fn plugin_name(&self) -> &'static str {
            "mysql_plugin"
        }

        async fn execute(&self, _body: &ConnectionBody, _opts: &ExecuteOptions) -> QueryResult {
            self.result.clone()
        }
    }

    fn stub_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.plugins.mysql.push(local("default", ""));
        config
    }

    fn one_row_result() -> QueryResult {
        let columns = vec!["1".to_string()];
        let rows = vec![vec![CellValue::Int(1)]];
        let maps = rows_to_maps(&columns, rows, false);
        QueryResult::success(columns, maps)
    }

    fn v2_sql_envelope(config_key: &str) -> Envelope {
        Envelope::from_value(json!({
            "specVersion": "2.0",
            "pluginName": "mysql_plugin",
            "data": {"configKey": config_key, "sql": "SELECT 1"}
        }))
    }

    #[tokio::test]
    async fn test_handle_success_frames_query_result() {
        let plugin = SqlPlugin::new(StubExecutor {
            result: one_row_result(),
        });
        plugin.init(&stub_config()).await.unwrap();

        let frame = plugin.handle(&v2_sql_envelope("default")).await.unwrap();
        assert_eq!(frame.code, 200);
        let response = frame.response().unwrap();
        assert_eq!(response["message"], "success");
        assert_eq!(response["columns"], json!(["1"]));
        assert_eq!(response["result"][0]["1"], json!(1));
    }

    #[tokio::test]
    async fn test_handle_missing_config_key_fails() {
        let plugin = SqlPlugin::new(StubExecutor {
            result: one_row_result(),
        });
        plugin.init(&stub_config()).await.unwrap();

        let err = plugin.handle(&v2_sql_envelope("missing")).await.unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(ref key) if key == "missing"));
    }

    #[tokio::test]
    async fn test_handle_empty_key_without_allow_remote_fails() {
        let plugin = SqlPlugin::new(StubExecutor {
            result: one_row_result(),
        });
        // no descriptors, allow_remote defaults to false
        plugin.init(&AgentConfig::default()).await.unwrap();

        let envelope = Envelope::from_value(json!({
            "specVersion": "2.0",
            "pluginName": "mysql_plugin",
            "data": {"host": "x", "user": "u", "sql": "SELECT 1"}
        }));
        let err = plugin.handle(&envelope).await.unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[tokio::test]
    async fn test_handle_backend_failure_stays_in_message() {
        let plugin = SqlPlugin::new(StubExecutor {
            result: QueryResult::failure("connection refused"),
        });
        plugin.init(&stub_config()).await.unwrap();

        let frame = plugin.handle(&v2_sql_envelope("default")).await.unwrap();
        assert_eq!(frame.code, 200);
        let response = frame.response().unwrap();
        assert_eq!(response["message"], "connection refused");
        assert_eq!(response["result"], json!([]));
    }

    #[tokio::test]
    async fn test_handle_v1_and_v2_envelopes_are_equivalent() {
        let plugin = SqlPlugin::new(StubExecutor {
            result: one_row_result(),
        });
        plugin.init(&stub_config()).await.unwrap();

        let v1 = Envelope::from_value(json!({
            "headers": {"specVersion": "1.0", "type": "MYSQL"},
            "body": {"configKey": "default", "configParams": {"sql": "SELECT 1"}}
        }));
        let v2 = v2_sql_envelope("default");

        let r1 = plugin.handle(&v1).await.unwrap().response().unwrap();
        let r2 = plugin.handle(&v2).await.unwrap().response().unwrap();
        assert_eq!(r1, r2);
    }

    struct SlowExecutor;

    #[async_trait]
    impl SqlExecutor for SlowExecutor {
        fn dialect(&self) -> &'static str {
            "mysql"
        }

        fn plugin_name(&self) -> &'static str {
            "mysql_plugin"
        }

        async fn execute(&self, _body: &ConnectionBody, _opts: &ExecuteOptions) -> QueryResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            QueryResult::failure("unreachable")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_enforces_query_deadline() {
        let plugin = SqlPlugin::new(SlowExecutor);
        plugin.init(&stub_config()).await.unwrap();

        let frame = plugin.handle(&v2_sql_envelope("default")).await.unwrap();
        let response = frame.response().unwrap();
        let message = response["message"].as_str().unwrap();
        assert!(message.contains("timed out"), "message: {message}");
    }
}
