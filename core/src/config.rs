use crate::error::ApiReturn;
use crate::transport_data::DataType;
use std::sync::Arc;
use std::time::Duration;

/// Pluggable policy hook turning a response body string into an [ApiReturn].
///
/// Defaults to `serde_json::from_str` when unset.
pub type DecodeReturnText = Arc<dyn Fn(&str) -> Result<ApiReturn, String> + Send + Sync>;

/// Pluggable policy hook turning an [ApiReturn] into a response body string.
pub type EncodeReturnText = Arc<dyn Fn(&ApiReturn) -> String + Send + Sync>;

#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// URL prefix under which text-mode calls carry the service name.
    pub json_host_path: String,
    pub default_data_type: DataType,
    /// Budget for one inbound exchange, decode through response.
    pub socket_timeout: Option<Duration>,
    /// `Access-Control-Allow-Origin` value; None disables CORS headers.
    pub cors: Option<String>,
    pub cors_max_age: Duration,
    /// Handler execution budget. On expiry the peer gets SERVER_TIMEOUT and
    /// the handler's late result is dropped.
    pub api_timeout: Option<Duration>,
    pub encode_return_text: Option<EncodeReturnText>,
    /// Whether a handler error's own message is exposed in `innerErr`.
    pub return_inner_error: bool,
    pub log_level: log::Level,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            json_host_path: "/".to_string(),
            default_data_type: DataType::Text,
            socket_timeout: None,
            cors: Some("*".to_string()),
            cors_max_age: Duration::from_secs(3600),
            api_timeout: None,
            encode_return_text: None,
            return_inner_error: default_return_inner_error(),
            log_level: log::Level::Debug,
        }
    }
}

/// Exposing handler internals to remote callers is only safe outside
/// production deployments.
fn default_return_inner_error() -> bool {
    match std::env::var("TSRPC_ENV") {
        Ok(v) => v != "production",
        Err(_) => true,
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub server: String,
    pub data_type: DataType,
    pub decode_return_text: Option<DecodeReturnText>,
    /// Default timeout for every callApi; per-call options may override.
    pub call_api_timeout: Option<Duration>,
    pub log_level: log::Level,
    /// Only meaningful on duplex transports; stateless transports ignore it.
    pub heartbeat: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:3000".to_string(),
            data_type: DataType::Text,
            decode_return_text: None,
            call_api_timeout: Some(Duration::from_secs(15)),
            log_level: log::Level::Warn,
            heartbeat: false,
        }
    }
}
