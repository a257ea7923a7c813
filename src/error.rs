use thiserror::Error;

/// Failures the dispatch core can report to the transport layer.
///
/// SQL backend failures deliberately do not appear here: a failed query is
/// reported inside the `QueryResult` message so the response frame still
/// carries status 200 (callers check the `"success"` sentinel).
#[derive(Debug, Error)]
pub enum Error {
    /// The raw envelope bytes are not a valid JSON document.
    #[error("malformed envelope: {0}")]
    Decode(String),
    /// The envelope payload cannot be coerced into the plugin's input shape.
    #[error("payload decode failed: {0}")]
    PayloadDecode(String),
    /// No executor is registered under the resolved plugin name.
    #[error("no plugin registered for {0:?}")]
    UnknownPlugin(String),
    /// No local connection descriptor for the config key and remote
    /// configuration is disabled.
    #[error("no connection config for key {0:?} and remote config is not allowed")]
    ConfigNotFound(String),
    /// HTTP transport failure or non-success status from the target.
    #[error("backend request failed: {0}")]
    Backend(String),
}

impl Error {
    pub fn decode(err: impl std::fmt::Display) -> Self {
        Error::Decode(err.to_string())
    }

    pub fn payload(err: impl std::fmt::Display) -> Self {
        Error::PayloadDecode(err.to_string())
    }

    pub fn backend(err: impl std::fmt::Display) -> Self {
        Error::Backend(err.to_string())
    }
}
