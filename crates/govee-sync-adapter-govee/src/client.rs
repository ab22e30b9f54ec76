//! HTTP client for the Govee OpenAPI.
//!
//! Implements [`RemoteApi`] on top of `reqwest`, translating HTTP status
//! codes and vendor envelopes into [`ApiError`] variants the gateway can
//! reason about.

use crate::encoding::{self, EncodingError};
use async_trait::async_trait;
use govee_sync_core::{Ack, ApiError, Command, DeviceDescriptor, RemoteApi, Reported};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "Govee-API-Key";

/// Govee client configuration.
#[derive(Debug, Clone)]
pub struct GoveeClientConfig {
    /// Base URL of the OpenAPI router
    pub base_url: String,
    /// Developer API key
    pub api_key: String,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for GoveeClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openapi.api.govee.com/router/api/v1".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP client for Govee device operations.
pub struct GoveeClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GoveeClient {
    /// Create a new Govee client.
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is invalid, the API key is empty, or
    /// the HTTP client cannot be created.
    pub fn new(config: GoveeClientConfig) -> Result<Self, ClientError> {
        let url = Url::parse(&config.base_url)
            .map_err(|e| ClientError::Init(format!("invalid base URL {}: {e}", config.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::Init(format!(
                "unsupported scheme {} in base URL",
                url.scheme()
            )));
        }
        if config.api_key.trim().is_empty() {
            return Err(ClientError::Init("API key is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .use_rustls_tls()
            .build()
            .map_err(|e| ClientError::Init(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let url = self.url(path);
        tracing::debug!(url, "GET");

        let request = self.client.get(&url).header(API_KEY_HEADER, &self.api_key);
        Self::execute(request).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        let url = self.url(path);
        tracing::debug!(url, %body, "POST");

        let request = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body);
        Self::execute(request).await
    }

    async fn execute(request: reqwest::RequestBuilder) -> Result<Value, ApiError> {
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, message));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ApiError::Malformed(e.to_string()))?;

        encoding::check_envelope(&body).map_err(map_encoding_error)?;
        Ok(body)
    }
}

fn request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Map an HTTP status to the error taxonomy.
#[must_use]
pub fn classify_status(status: StatusCode, message: String) -> ApiError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ApiError::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiError::Transient(format!("{status}: {message}"))
    } else {
        ApiError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

fn map_encoding_error(error: EncodingError) -> ApiError {
    match error {
        EncodingError::Vendor { code, message } => match StatusCode::from_u16(code) {
            Ok(status) => classify_status(status, message),
            Err(_) => ApiError::Rejected {
                status: code,
                message,
            },
        },
        other => ApiError::Malformed(other.to_string()),
    }
}

#[async_trait]
impl RemoteApi for GoveeClient {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ApiError> {
        let body = self.get("user/devices").await?;
        encoding::decode_device_list(&body).map_err(map_encoding_error)
    }

    async fn get_state(&self, device: &DeviceDescriptor) -> Result<Reported, ApiError> {
        let body = encoding::state_request(&request_id(), device);
        let response = self.post("device/state", &body).await?;
        encoding::decode_state(&response, device).map_err(map_encoding_error)
    }

    async fn send_command(
        &self,
        device: &DeviceDescriptor,
        command: &Command,
    ) -> Result<Ack, ApiError> {
        let body = encoding::control_request(&request_id(), device, command).map_err(|e| {
            ApiError::Rejected {
                status: StatusCode::BAD_REQUEST.as_u16(),
                message: e.to_string(),
            }
        })?;
        let response = self.post("device/control", &body).await?;
        Ok(Ack {
            reported: encoding::decode_control_response(&response, device),
        })
    }
}

/// Errors that can occur creating the Govee client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Client initialization failed
    #[error("client init error: {0}")]
    Init(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GoveeClientConfig {
        GoveeClientConfig {
            api_key: "test-key".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn config_default() {
        let config = GoveeClientConfig::default();
        assert_eq!(
            config.base_url,
            "https://openapi.api.govee.com/router/api/v1"
        );
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.api_key.is_empty());
    }

    #[test]
    fn client_creation() {
        let client = GoveeClient::new(config()).unwrap();
        assert_eq!(
            client.url("user/devices"),
            "https://openapi.api.govee.com/router/api/v1/user/devices"
        );
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = GoveeClient::new(GoveeClientConfig {
            base_url: "http://localhost:8080/v1/".to_string(),
            ..config()
        })
        .unwrap();
        assert_eq!(client.url("device/state"), "http://localhost:8080/v1/device/state");
    }

    #[test]
    fn client_creation_rejects_bad_config() {
        let bad_url = GoveeClient::new(GoveeClientConfig {
            base_url: "not a url".to_string(),
            ..config()
        });
        assert!(format!("{}", bad_url.err().unwrap()).contains("client init error"));

        let no_key = GoveeClient::new(GoveeClientConfig::default());
        assert!(no_key.is_err());
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ApiError::RateLimited
        );
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, "out of range".into()),
            ApiError::Rejected {
                status: 400,
                message: "out of range".into()
            }
        );
    }

    #[test]
    fn vendor_codes_follow_http_classification() {
        let err = map_encoding_error(EncodingError::Vendor {
            code: 429,
            message: String::new(),
        });
        assert_eq!(err, ApiError::RateLimited);

        let err = map_encoding_error(EncodingError::Missing("data"));
        assert!(matches!(err, ApiError::Malformed(_)));
    }
}
