//! Minimal HTTP/1 client for the capgridd API.

use std::time::Duration;

use bytes::Bytes;
use capgrid_config::ConfigError;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CliError {
    /// The daemon rejected the request (4xx).
    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    Usage(String),

    /// The daemon could not be reached or failed (5xx).
    #[error("{0}")]
    External(String),
}

/// 1 for validation errors, 2 for external-dependency failures.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<CliError>() {
        return match e {
            CliError::Rejected(_) | CliError::Usage(_) => 1,
            CliError::External(_) => 2,
        };
    }
    match err.downcast_ref::<ConfigError>() {
        Some(ConfigError::Parse(_) | ConfigError::Validation(_)) => 1,
        _ => 2,
    }
}

pub struct ApiClient {
    address: String,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(address: &str, timeout: Duration) -> Self {
        let address = address
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        Self { address, timeout }
    }

    pub async fn get(&self, path: &str) -> Result<Value, CliError> {
        self.send(Method::GET, path).await
    }

    pub async fn post(&self, path: &str) -> Result<Value, CliError> {
        self.send(Method::POST, path).await
    }

    /// Send a request and unwrap the `data` field of the response envelope.
    async fn send(&self, method: Method, path: &str) -> Result<Value, CliError> {
        let url = format!("http://{}{path}", self.address);
        debug!(%method, %url, "api request");

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&self.address)
                .await
                .map_err(|e| CliError::External(format!("cannot reach capgridd at {}: {e}", self.address)))?;
            let io = TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| CliError::External(format!("handshake with {}: {e}", self.address)))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let request = http::Request::builder()
                .method(method)
                .uri(path)
                .header("host", &self.address)
                .header("user-agent", concat!("capctl/", env!("CARGO_PKG_VERSION")))
                .body(Full::new(Bytes::new()))
                .map_err(|e| CliError::Usage(format!("bad request {url}: {e}")))?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| CliError::External(format!("{url}: {e}")))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| CliError::External(format!("{url}: {e}")))?
                .to_bytes();
            Ok::<_, CliError>((status, bytes))
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| CliError::External(format!("{url} timed out after {:?}", self.timeout)))??;
        unwrap_envelope(status, &bytes)
    }
}

fn unwrap_envelope(status: StatusCode, bytes: &[u8]) -> Result<Value, CliError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| {
        CliError::External(format!("unexpected response ({status}): {e}"))
    })?;
    if status.is_success() {
        return Ok(value.get("data").cloned().unwrap_or(Value::Null));
    }
    let message = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("request failed")
        .to_string();
    if status.is_client_error() {
        Err(CliError::Rejected(message))
    } else {
        Err(CliError::External(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_data_is_unwrapped() {
        let body = br#"{"success":true,"data":{"pending":3}}"#;
        let value = unwrap_envelope(StatusCode::OK, body).unwrap();
        assert_eq!(value["pending"], 3);
    }

    #[test]
    fn client_errors_are_rejections() {
        let body = br#"{"success":false,"error":"node not found: n9"}"#;
        let err = unwrap_envelope(StatusCode::NOT_FOUND, body).unwrap_err();
        assert!(matches!(err, CliError::Rejected(ref m) if m.contains("n9")));
        assert_eq!(exit_code(&anyhow::Error::from(err)), 1);
    }

    #[test]
    fn server_errors_are_external() {
        let body = br#"{"success":false,"error":"transaction error"}"#;
        let err = unwrap_envelope(StatusCode::INTERNAL_SERVER_ERROR, body).unwrap_err();
        assert_eq!(exit_code(&anyhow::Error::from(err)), 2);
    }

    #[tokio::test]
    async fn unreachable_daemon_is_external() {
        // Port 9 (discard) is closed on test hosts.
        let client = ApiClient::new("127.0.0.1:9", Duration::from_secs(2));
        let err = client.get("/api/v1/status").await.unwrap_err();
        assert!(matches!(err, CliError::External(_)));
    }

    #[test]
    fn address_accepts_url_form() {
        let client = ApiClient::new("http://10.0.0.1:7480/", Duration::from_secs(1));
        assert_eq!(client.address, "10.0.0.1:7480");
    }
}
