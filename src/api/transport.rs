//! HTTP transport seam
//!
//! Requests are plain data so they can be replayed by the retry loop with a
//! replaced Authorization header. [`ReqwestTransport`] is the production
//! implementation; tests script responses through the same trait.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// HTTP client timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const AUTHORIZATION: &str = "Authorization";
pub const CONTENT_TYPE: &str = "Content-Type";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// POST with no body
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            ..Self::get(url)
        }
    }

    pub fn post_json<T: Serialize + ?Sized>(url: impl Into<String>, body: &T) -> serde_json::Result<Self> {
        let body = serde_json::to_string(body)?;
        Ok(Self {
            body: Some(body),
            ..Self::post(url)
        }
        .with_header(CONTENT_TYPE, "application/json"))
    }

    pub fn post_form(url: impl Into<String>, fields: &[(&str, &str)]) -> Self {
        let body = fields
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        Self {
            body: Some(body),
            ..Self::post(url)
        }
        .with_header(CONTENT_TYPE, "application/x-www-form-urlencoded")
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Replace any existing header of the same name (case-insensitive)
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}

/// Sends one request. Transport failures (DNS, connect, timeout) are errors;
/// any HTTP status, including 4xx and 5xx, is a response.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", request.url))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read response body from {}", request.url))?;

        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_body_is_encoded() {
        let request = ApiRequest::post_form(
            "https://auth.example/token",
            &[("grant_type", "refresh_token"), ("refresh_token", "a b&c")],
        );
        assert_eq!(
            request.body.as_deref(),
            Some("grant_type=refresh_token&refresh_token=a%20b%26c")
        );
        assert_eq!(request.header("content-type"), Some("application/x-www-form-urlencoded"));
    }

    #[test]
    fn test_set_header_replaces() {
        let mut request = ApiRequest::get("https://api.example").with_header(AUTHORIZATION, "Bearer old");
        request.set_header("authorization", "Bearer new");
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.header(AUTHORIZATION), Some("Bearer new"));
    }

    #[test]
    fn test_response_json() {
        let response = ApiResponse::new(200, r#"{"used": 12}"#);
        assert!(response.is_success());
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["used"], 12);
        assert!(!ApiResponse::new(404, "").is_success());
    }
}
