//! Envelope model: classifies the two wire schemas ("1.0"/"2.0") behind one
//! stable accessor surface so executors never touch raw schema differences.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Plugin names the envelope model can resolve to. v2 envelopes may carry
/// future names verbatim; these are the ones v1 routing knows about.
pub const HTTP_PLUGIN: &str = "http_plugin";
pub const MYSQL_PLUGIN: &str = "mysql_plugin";
pub const MSSQL_PLUGIN: &str = "mssql_plugin";
pub const PGSQL_PLUGIN: &str = "pgsql_plugin";
pub const ORACLEDB_PLUGIN: &str = "oracledb_plugin";
pub const VERSION_PLUGIN: &str = "version_plugin";

/// Which of the two incompatible envelope schemas a message uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    /// Legacy schema: plugin type under `headers.type`, payload under `body`.
    V1,
    /// Current schema: top-level `specVersion`, `pluginName` and `data`.
    V2,
    /// No recognizable `specVersion` anywhere. Routed to the HTTP relay.
    Unknown,
}

/// One inbound message, parsed once into a generic JSON document.
#[derive(Debug, Clone)]
pub struct Envelope {
    doc: Value,
}

impl Envelope {
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        let doc: Value = serde_json::from_slice(raw).map_err(Error::decode)?;
        Ok(Self { doc })
    }

    pub fn from_value(doc: Value) -> Self {
        Self { doc }
    }

    /// The declared schema version string: top-level `specVersion` first,
    /// then `headers.specVersion`, else `"unknown"`.
    pub fn spec_version(&self) -> &str {
        if let Some(v) = self.doc.get("specVersion").and_then(Value::as_str) {
            return v;
        }
        if let Some(v) = self
            .doc
            .get("headers")
            .and_then(|h| h.get("specVersion"))
            .and_then(Value::as_str)
        {
            return v;
        }
        "unknown"
    }

    pub fn schema(&self) -> SchemaVersion {
        match self.spec_version() {
            "1.0" => SchemaVersion::V1,
            "2.0" => SchemaVersion::V2,
            _ => SchemaVersion::Unknown,
        }
    }

    /// Resolve the target plugin name. Unknown or unroutable envelopes
    /// degrade to the HTTP relay rather than failing outright.
    pub fn plugin_name(&self) -> &str {
        match self.schema() {
            SchemaVersion::V1 => self.plugin_name_v1(),
            SchemaVersion::V2 => self
                .doc
                .get("pluginName")
                .and_then(Value::as_str)
                .unwrap_or(HTTP_PLUGIN),
            SchemaVersion::Unknown => HTTP_PLUGIN,
        }
    }

    fn plugin_name_v1(&self) -> &'static str {
        let kind = self
            .doc
            .get("headers")
            .and_then(|h| h.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if kind.eq_ignore_ascii_case("http") {
            HTTP_PLUGIN
        } else if kind.eq_ignore_ascii_case("mysql") {
            MYSQL_PLUGIN
        } else {
            HTTP_PLUGIN
        }
    }

    /// The plugin-specific payload, opaque to the dispatcher.
    ///
    /// v1 HTTP-routed messages carry the original caller body as a string in
    /// `body.httpRequest.body`; v1 SQL-routed messages carry the whole `body`
    /// structure. v2 messages carry a top-level `data` field.
    pub fn payload(&self) -> Option<Value> {
        match self.schema() {
            SchemaVersion::V1 => {
                let body = self.doc.get("body")?;
                if self.plugin_name_v1() == HTTP_PLUGIN {
                    body.get("httpRequest").and_then(|r| r.get("body")).cloned()
                } else {
                    Some(body.clone())
                }
            }
            SchemaVersion::V2 => self.doc.get("data").cloned(),
            SchemaVersion::Unknown => None,
        }
    }

    /// Decode the payload into the plugin's input shape. A string payload is
    /// parsed as embedded JSON; anything else goes through `from_value`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let payload = self.payload().ok_or_else(|| {
            Error::PayloadDecode(format!("no payload for version {:?}", self.spec_version()))
        })?;
        match payload {
            Value::String(s) => serde_json::from_str(&s).map_err(Error::payload),
            other => serde_json::from_value(other).map_err(Error::payload),
        }
    }

    /// Typed view of the full v1 protocol frame.
    pub fn model_v1(&self) -> Result<V1Protocol, Error> {
        serde_json::from_value(self.doc.clone()).map_err(Error::payload)
    }
}

/// v1 protocol frame as the legacy gateway wraps it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct V1Protocol {
    pub headers: V1Headers,
    pub body: V1Body,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct V1Headers {
    pub spec_version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub connector_id: String,
    pub action_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct V1Body {
    pub http_request: HttpRequest,
    pub config_params: HashMap<String, String>,
    pub config_key: String,
}

/// HTTP request descriptor carried inside envelopes (v1 `body.httpRequest`,
/// or the v2 `data` payload for the HTTP relay).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpRequest {
    pub headers: HashMap<String, String>,
    pub method: String,
    pub body: String,
    pub content_type: String,
    pub url: String,
    /// Seconds. Zero means "use the default" (5 s).
    pub timeout: u64,
}

/// Plugin results are wrapped as `{"response": …}` before being framed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub response: Value,
}

/// Transport-level response frame: an HTTP-like status code, headers and the
/// JSON-encoded callback payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameResponse {
    pub code: u16,
    pub headers: HashMap<String, String>,
    pub message: String,
    pub data: String,
}

impl Default for FrameResponse {
    fn default() -> Self {
        Self {
            code: 200,
            headers: HashMap::new(),
            message: String::from("ok"),
            data: String::new(),
        }
    }
}

impl FrameResponse {
    pub fn success(response: Value) -> Self {
        let data = Value::from(serde_json::Map::from_iter([(
            String::from("response"),
            response,
        )]))
        .to_string();
        Self {
            code: 200,
            headers: HashMap::from([(
                String::from("contentType"),
                String::from("application/json"),
            )]),
            message: String::from("ok"),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: 500,
            headers: HashMap::new(),
            message: message.into(),
            data: String::new(),
        }
    }

    /// Recover the plugin result wrapped by `success`.
    pub fn response(&self) -> Result<Value, Error> {
        let cr: CallbackResponse = serde_json::from_str(&self.data).map_err(Error::decode)?;
        Ok(cr.response)
    }
}
