//! HTTP relay executor. Forwards the caller's request over `reqwest` and
//! normalizes the response, and on the legacy schema re-routes envelopes
//! tagged with a plugin-name header back through the registry.

use std::collections::HashMap;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::envelope::{Envelope, FrameResponse, HttpRequest, SchemaVersion, HTTP_PLUGIN};
use crate::error::Error;

use super::PluginManager;

/// Legacy header naming the executor an envelope should be re-routed to.
const ROUTE_HEADER: &str = "x-ipaas-plugin-name";

const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Normalized relay outcome handed back to the caller. Multi-value response
/// headers are flattened with commas; `content` holds parsed JSON when the
/// body is JSON and the raw text otherwise.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status_code: u16,
    pub status: String,
    pub proto: String,
    pub headers: HashMap<String, String>,
    pub content: Value,
}

pub struct HttpPlugin {
    manager: Weak<PluginManager>,
    client: reqwest::Client,
}

impl HttpPlugin {
    pub fn new(manager: Weak<PluginManager>) -> Self {
        Self {
            manager,
            client: reqwest::Client::new(),
        }
    }

    async fn handle_v1(&self, envelope: &Envelope) -> Result<FrameResponse, Error> {
        let model = envelope.model_v1()?;

        if let Some(target) = secondary_route(&model.body.http_request.headers) {
            // Re-routing back to this executor would recurse forever.
            if target != HTTP_PLUGIN {
                if let Some(manager) = self.manager.upgrade() {
                    if manager.contains(target).await {
                        debug!(plugin = %target, "secondary routing");
                        let frame = manager.handle_with(target, envelope).await?;
                        let response = repackage(&frame)?;
                        return frame_response(&response);
                    }
                }
            }
        }

        let response = self.relay(&model.body.http_request).await?;
        frame_response(&response)
    }

    async fn handle_v2(&self, envelope: &Envelope) -> Result<FrameResponse, Error> {
        let request: HttpRequest = envelope.decode_payload()?;
        let response = self.relay(&request).await?;
        frame_response(&response)
    }

    async fn relay(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        let method = Method::from_bytes(request.method.as_bytes()).map_err(Error::payload)?;
        debug!(method = %method, url = %request.url, "relaying http request");

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(Duration::from_secs(effective_timeout(request.timeout)));
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if !request.content_type.is_empty() {
            builder = builder.header(CONTENT_TYPE, &request.content_type);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let resp = builder.send().await.map_err(Error::backend)?;
        let status = resp.status();
        let proto = format!("{:?}", resp.version());

        let mut headers = HashMap::new();
        for key in resp.headers().keys() {
            let joined: Vec<&str> = resp
                .headers()
                .get_all(key)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            headers.insert(key.to_string(), joined.join(","));
        }

        let body = resp.text().await.map_err(Error::backend)?;
        if !status.is_success() {
            return Err(Error::Backend(format!(
                "unexpected status {status}: {body}"
            )));
        }

        let content = serde_json::from_str(&body).unwrap_or(Value::String(body));
        Ok(HttpResponse {
            status_code: status.as_u16(),
            status: status_text(status.as_u16()),
            proto,
            headers,
            content,
        })
    }
}

#[async_trait]
impl super::Plugin for HttpPlugin {
    fn name(&self) -> &str {
        HTTP_PLUGIN
    }

    async fn init(&self, _config: &AgentConfig) -> anyhow::Result<()> {
        info!(plugin = HTTP_PLUGIN, "http plugin initialized");
        Ok(())
    }

    async fn handle(&self, envelope: &Envelope) -> Result<FrameResponse, Error> {
        match envelope.schema() {
            SchemaVersion::V1 => self.handle_v1(envelope).await,
            SchemaVersion::V2 => self.handle_v2(envelope).await,
            SchemaVersion::Unknown => Err(Error::Decode(format!(
                "unsupported specVersion: {}",
                envelope.spec_version()
            ))),
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        info!(plugin = HTTP_PLUGIN, "http plugin closed");
        Ok(())
    }
}

fn effective_timeout(timeout: u64) -> u64 {
    if timeout == 0 {
        DEFAULT_TIMEOUT_SECS
    } else {
        timeout
    }
}

fn status_text(code: u16) -> String {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
        .to_string()
}

/// Find the re-routing target named by the legacy header, matching the
/// header name case-insensitively.
fn secondary_route(headers: &HashMap<String, String>) -> Option<&str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(ROUTE_HEADER))
        .map(|(_, value)| value.as_str())
}

/// Wrap a delegated executor's frame in the HTTP-response shape legacy
/// callers expect. String results pass through as the body text, anything
/// else is serialized back to JSON.
fn repackage(frame: &FrameResponse) -> Result<HttpResponse, Error> {
    let value = frame.response()?;
    let body = match value {
        Value::String(s) => s,
        other => serde_json::to_string(&other).map_err(Error::payload)?,
    };
    Ok(HttpResponse {
        status_code: frame.code,
        status: status_text(frame.code),
        proto: String::from("HTTP/1.1"),
        headers: HashMap::new(),
        content: Value::String(body),
    })
}

fn frame_response(response: &HttpResponse) -> Result<FrameResponse, Error> {
    let value = serde_json::to_value(response).map_err(Error::payload)?;
    Ok(FrameResponse::success(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::Plugin;
    use serde_json::json;

    #[test]
    fn test_effective_timeout_defaults() {
        assert_eq!(effective_timeout(0), 5);
        assert_eq!(effective_timeout(30), 30);
    }

    #[test]
    fn test_secondary_route_case_insensitive() {
        let headers = HashMap::from([(
            String::from("X-IPaaS-Plugin-Name"),
            String::from("mysql_plugin"),
        )]);
        assert_eq!(secondary_route(&headers), Some("mysql_plugin"));

        let headers = HashMap::from([(String::from("Content-Type"), String::from("text/plain"))]);
        assert_eq!(secondary_route(&headers), None);
    }

    #[test]
    fn test_repackage_string_result() {
        let frame = FrameResponse::success(json!("plain text result"));
        let resp = repackage(&frame).unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.status, "OK");
        assert_eq!(resp.proto, "HTTP/1.1");
        assert_eq!(resp.content, json!("plain text result"));
    }

    #[test]
    fn test_repackage_structured_result() {
        let frame = FrameResponse::success(json!({"columns": ["id"], "message": "success"}));
        let resp = repackage(&frame).unwrap();
        let body = resp.content.as_str().unwrap();
        let parsed: Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed["message"], "success");
    }

    #[test]
    fn test_http_response_serializes_camel_case() {
        let resp = HttpResponse {
            status_code: 204,
            status: String::from("No Content"),
            proto: String::from("HTTP/1.1"),
            headers: HashMap::new(),
            content: Value::Null,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["statusCode"], 204);
        assert_eq!(value["proto"], "HTTP/1.1");
    }

    #[tokio::test]
    async fn test_unknown_schema_rejected() {
        let plugin = HttpPlugin::new(Weak::new());
        let envelope = Envelope::from_value(json!({"headers": {}, "body": {}}));
        let err = plugin.handle(&envelope).await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering every connection with a canned
    /// response.
    async fn stub_server(response: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn get_request(addr: std::net::SocketAddr) -> HttpRequest {
        HttpRequest {
            method: String::from("GET"),
            url: format!("http://{addr}/"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_relay_parses_json_body_and_flattens_headers() {
        let addr = stub_server(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/json\r\n\
             X-Multi: a\r\n\
             X-Multi: b\r\n\
             Content-Length: 13\r\n\
             Connection: close\r\n\
             \r\n\
             {\"value\":123}",
        )
        .await;
        let plugin = HttpPlugin::new(Weak::new());

        let resp = plugin.relay(&get_request(addr)).await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.status, "OK");
        assert_eq!(resp.content, json!({"value": 123}));
        assert_eq!(resp.headers.get("x-multi").unwrap(), "a,b");
    }

    #[tokio::test]
    async fn test_relay_keeps_non_json_body_as_text() {
        let addr = stub_server(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: 5\r\n\
             Connection: close\r\n\
             \r\n\
             hello",
        )
        .await;
        let plugin = HttpPlugin::new(Weak::new());

        let resp = plugin.relay(&get_request(addr)).await.unwrap();
        assert_eq!(resp.content, json!("hello"));
    }

    #[tokio::test]
    async fn test_relay_non_success_status_is_backend_error() {
        let addr = stub_server(
            "HTTP/1.1 500 Internal Server Error\r\n\
             Content-Length: 4\r\n\
             Connection: close\r\n\
             \r\n\
             boom",
        )
        .await;
        let plugin = HttpPlugin::new(Weak::new());

        let err = plugin.relay(&get_request(addr)).await.unwrap_err();
        match err {
            Error::Backend(msg) => {
                assert!(msg.contains("500"), "message: {msg}");
                assert!(msg.contains("boom"), "message: {msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    struct EchoPlugin;

    #[async_trait]
    impl super::super::Plugin for EchoPlugin {
        fn name(&self) -> &str {
            "stub_plugin"
        }

        async fn init(&self, _config: &AgentConfig) -> anyhow::Result<()> {
            Ok(())
        }

        async fn handle(&self, _envelope: &Envelope) -> Result<FrameResponse, Error> {
            Ok(FrameResponse::success(json!({"echo": true})))
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_secondary_routing_delegates() {
        let manager = PluginManager::new();
        manager.register(std::sync::Arc::new(EchoPlugin)).await;
        let plugin = HttpPlugin::new(std::sync::Arc::downgrade(&manager));

        let envelope = Envelope::from_value(json!({
            "headers": {"specVersion": "1.0", "type": "HTTP"},
            "body": {
                "httpRequest": {
                    "headers": {"X-Ipaas-Plugin-Name": "stub_plugin"},
                    "method": "POST",
                    "url": "http://ignored",
                    "body": "{}"
                }
            }
        }));

        let frame = plugin.handle(&envelope).await.unwrap();
        assert_eq!(frame.code, 200);
        let response = frame.response().unwrap();
        assert_eq!(response["proto"], "HTTP/1.1");
        assert_eq!(response["statusCode"], 200);
    }
}
