//! Retrying HTTP client
//!
//! Attaches the bearer token, refreshes it once per 401 and backs off
//! exponentially on 429, 5xx and transport failures.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::errors::{ApiError, StatusClass};
use super::token::TokenManager;
use super::transport::{ApiRequest, ApiResponse, HttpTransport, AUTHORIZATION};

/// Attempts per request, the first one included
pub const DEFAULT_RETRIES: u32 = 5;

/// Backoff base; attempt `n` waits `base * 2^n`
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

#[derive(Clone)]
pub struct ResilientFetcher {
    transport: Arc<dyn HttpTransport>,
    tokens: TokenManager,
}

fn backoff(base_delay: Duration, attempt: u32) -> Duration {
    base_delay.saturating_mul(2u32.saturating_pow(attempt))
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

impl ResilientFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, tokens: TokenManager) -> Self {
        Self { transport, tokens }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Send with the default budget of 5 attempts and a 1 s backoff base
    pub async fn fetch_with_retry(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.fetch_with(request, DEFAULT_RETRIES, DEFAULT_BASE_DELAY).await
    }

    /// Send `request`, retrying per status class
    ///
    /// 2xx, 404 and other non-retryable statuses come back as `Ok`; callers
    /// inspect the status. Errors are only raised for a failed token refresh,
    /// a transport failure on the last attempt, or an exhausted budget.
    pub async fn fetch_with(
        &self,
        mut request: ApiRequest,
        retries: u32,
        base_delay: Duration,
    ) -> Result<ApiResponse, ApiError> {
        let token = self.tokens.get_access_token().await?;
        request.set_header(AUTHORIZATION, bearer(&token));

        for attempt in 0..retries {
            let last_attempt = attempt + 1 == retries;

            match self.transport.send(&request).await {
                Ok(response) => match StatusClass::from_status(response.status) {
                    StatusClass::Success | StatusClass::NotFound | StatusClass::Fatal => {
                        debug!(url = %request.url, status = response.status, attempt = attempt + 1, "Request complete");
                        return Ok(response);
                    }
                    StatusClass::Unauthorized => {
                        self.tokens.invalidate_access_token().await;
                        if last_attempt {
                            warn!(url = %request.url, attempt = attempt + 1, "Access token rejected on last attempt");
                            continue;
                        }
                        warn!(url = %request.url, attempt = attempt + 1, "Access token rejected, refreshing");
                        let token = self.tokens.get_access_token().await?;
                        request.set_header(AUTHORIZATION, bearer(&token));
                    }
                    StatusClass::Retryable => {
                        if !last_attempt {
                            let delay = backoff(base_delay, attempt);
                            warn!(
                                url = %request.url,
                                status = response.status,
                                attempt = attempt + 1,
                                max = retries,
                                delay_ms = delay.as_millis() as u64,
                                "Retrying request"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                },
                Err(e) => {
                    if last_attempt {
                        return Err(ApiError::Network(format!("{:#}", e)));
                    }
                    let delay = backoff(base_delay, attempt);
                    warn!(
                        url = %request.url,
                        attempt = attempt + 1,
                        max = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying request after network error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        warn!(url = %request.url, attempts = retries, "Retry budget exhausted");
        Err(ApiError::RetryExhausted { attempts: retries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::token::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
    use crate::api::AuthError;
    use crate::kv::Kv;
    use crate::testing::MockTransport;

    const API_URL: &str = "https://api.example/2/files/list_folder";
    const TOKEN_URL: &str = "https://auth.example/oauth2/token";

    async fn fetcher(transport: &Arc<MockTransport>) -> ResilientFetcher {
        let kv = Kv::in_memory();
        kv.set(REFRESH_TOKEN_KEY, "long-lived", None).await.unwrap();
        kv.set(ACCESS_TOKEN_KEY, "initial", Some(3600)).await.unwrap();
        let tokens = TokenManager::new(kv, transport.clone(), TOKEN_URL, "app", "secret");
        ResilientFetcher::new(transport.clone(), tokens)
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(1000);
        assert_eq!(backoff(base, 0), Duration::from_millis(1000));
        assert_eq!(backoff(base, 1), Duration::from_millis(2000));
        assert_eq!(backoff(base, 4), Duration::from_millis(16000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_refreshes_once() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(API_URL, 401, "");
        transport.respond(API_URL, 200, "{}");
        transport.respond(TOKEN_URL, 200, r#"{"access_token": "second", "expires_in": 14400}"#);
        let fetcher = fetcher(&transport).await;

        let started = tokio::time::Instant::now();
        let response = fetcher.fetch_with_retry(ApiRequest::post(API_URL)).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(started.elapsed(), Duration::ZERO);

        assert_eq!(transport.requests_to(TOKEN_URL).len(), 1);
        let calls = transport.requests_to(API_URL);
        assert_eq!(calls[0].header(AUTHORIZATION), Some("Bearer initial"));
        assert_eq!(calls[1].header(AUTHORIZATION), Some("Bearer second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhausts_budget() {
        let transport = Arc::new(MockTransport::new());
        for _ in 0..6 {
            transport.respond(API_URL, 429, "");
        }
        let fetcher = fetcher(&transport).await;

        let err = fetcher.fetch_with_retry(ApiRequest::post(API_URL)).await.unwrap_err();
        assert!(matches!(err, ApiError::RetryExhausted { attempts: 5 }));
        assert_eq!(transport.requests_to(API_URL).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_backs_off_once() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(API_URL, 500, "");
        transport.respond(API_URL, 200, "{}");
        let fetcher = fetcher(&transport).await;

        let started = tokio::time::Instant::now();
        let response = fetcher.fetch_with_retry(ApiRequest::post(API_URL)).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(started.elapsed(), DEFAULT_BASE_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_returns_without_retry() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(API_URL, 404, "");
        let fetcher = fetcher(&transport).await;

        let response = fetcher.fetch_with_retry(ApiRequest::post(API_URL)).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(transport.requests_to(API_URL).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_returns_without_retry() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(API_URL, 409, r#"{"error_summary": "path/conflict/"}"#);
        let fetcher = fetcher(&transport).await;

        let response = fetcher.fetch_with_retry(ApiRequest::post(API_URL)).await.unwrap();
        assert_eq!(response.status, 409);
        assert_eq!(transport.requests_to(API_URL).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_surfaces_on_last_attempt() {
        let transport = Arc::new(MockTransport::new());
        transport.fail(API_URL, "connection reset");
        transport.respond(API_URL, 200, "{}");
        let client = fetcher(&transport).await;
        let response = client.fetch_with_retry(ApiRequest::post(API_URL)).await.unwrap();
        assert_eq!(response.status, 200);

        let transport = Arc::new(MockTransport::new());
        transport.fail(API_URL, "connection reset");
        transport.fail(API_URL, "connection reset");
        let client = fetcher(&transport).await;
        let err = client
            .fetch_with(ApiRequest::post(API_URL), 2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Network(ref message) if message.contains("connection reset")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_on_last_attempt_skips_refresh() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(API_URL, 401, "");
        transport.respond(API_URL, 401, "");
        transport.respond(TOKEN_URL, 200, r#"{"access_token": "second", "expires_in": 14400}"#);
        let kv = Kv::in_memory();
        kv.set(REFRESH_TOKEN_KEY, "long-lived", None).await.unwrap();
        kv.set(ACCESS_TOKEN_KEY, "initial", Some(3600)).await.unwrap();
        let tokens = TokenManager::new(kv.clone(), transport.clone(), TOKEN_URL, "app", "secret");
        let client = ResilientFetcher::new(transport.clone(), tokens);

        let err = client
            .fetch_with(ApiRequest::post(API_URL), 2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::RetryExhausted { attempts: 2 }));
        // Only the first rejection refreshed; the second just drops the token
        assert_eq!(transport.requests_to(TOKEN_URL).len(), 1);
        assert_eq!(transport.requests_to(API_URL).len(), 2);
        assert!(!kv.exists(ACCESS_TOKEN_KEY).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_during_retry_surfaces_session_expired() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(API_URL, 401, "");
        transport.respond(TOKEN_URL, 400, r#"{"error": "invalid_grant"}"#);
        let fetcher = fetcher(&transport).await;

        let err = fetcher.fetch_with_retry(ApiRequest::post(API_URL)).await.unwrap_err();
        assert!(matches!(err, ApiError::Auth(AuthError::SessionExpired)));
        assert!(err.is_session_expired());
    }
}
