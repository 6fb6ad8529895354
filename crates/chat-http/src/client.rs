//! REST client
//!
//! [`HttpClient::request`] is the single entry point for API calls. It holds
//! the route's bucket for the whole exchange, honors global lockouts, and
//! applies the retry policy:
//! - 429: record the lockout, retry up to `max_retries` times
//! - 500/502/503/504 and transport failures: back off `base * (1 + 2n)`
//! - other 4xx: fail immediately with the decoded error body

use crate::error::{HttpError, HttpResult};
use crate::models::{ApiErrorBody, GatewayBotInfo, GatewayInfo, RateLimitedBody};
use crate::ratelimit::{secs, RateLimitHeaders, RateLimiter};
use crate::route::Route;
use chat_common::HttpConfig;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const AUDIT_LOG_REASON: &str = "X-Audit-Log-Reason";

/// Per-request extras
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// JSON request body
    pub json: Option<serde_json::Value>,
    /// Shown in the guild audit log
    pub reason: Option<String>,
    pub query: Vec<(String, String)>,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }
}

struct ClientInner {
    client: reqwest::Client,
    base: Url,
    token: String,
    config: HttpConfig,
    limiter: RateLimiter,
}

/// Rate-limited API client; cheap to clone
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("base", &self.inner.base.as_str())
            .field("buckets", &self.inner.limiter.bucket_count())
            .finish()
    }
}

impl HttpClient {
    /// Create a client authenticating with a bot token
    pub fn new(token: impl Into<String>, config: HttpConfig) -> HttpResult<Self> {
        let base = Url::parse(&config.api_base)
            .map_err(|e| HttpError::Config(format!("invalid api base {}: {e}", config.api_base)))?;
        if base.cannot_be_a_base() {
            return Err(HttpError::Config(format!(
                "api base {} cannot hold a path",
                config.api_base
            )));
        }

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                client,
                base,
                token: token.into(),
                config,
                limiter: RateLimiter::new(),
            }),
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn config(&self) -> &HttpConfig {
        &self.inner.config
    }

    /// Full URL for a route
    pub fn url_for(&self, route: &Route) -> HttpResult<Url> {
        let segments = route.segments()?;
        let mut url = self.inner.base.clone();
        url.path_segments_mut()
            .map_err(|()| HttpError::Config("api base cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Issue a request and decode its JSON body; an empty body decodes as `null`
    pub async fn request<T: DeserializeOwned>(
        &self,
        route: Route,
        options: RequestOptions,
    ) -> HttpResult<T> {
        let body = self.request_bytes(&route, &options).await?;
        if body.is_empty() {
            return Ok(serde_json::from_slice(b"null")?);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Issue a request and return the raw body of the successful response
    pub async fn request_bytes(&self, route: &Route, options: &RequestOptions) -> HttpResult<Vec<u8>> {
        let key = route.bucket_key();
        let url = self.url_for(route)?;
        let limiter = &self.inner.limiter;
        let max_retries = self.inner.config.max_retries;
        let mut attempt: u32 = 0;

        loop {
            let bucket = limiter.bucket(&key);
            let mut guard = bucket.acquire().await;
            limiter.wait_global().await;
            guard.wait_until_ready().await;

            let sent = self
                .build(route.method(), &url, options)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    drop(guard);
                    if attempt >= max_retries {
                        return Err(err.into());
                    }
                    let delay = self.server_error_delay(attempt);
                    tracing::warn!(
                        route = %route,
                        attempt,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status();
            let headers = RateLimitHeaders::from_headers(response.headers());
            if let Some(hash) = &headers.bucket {
                limiter.learn_bucket_hash(&key, hash);
            }
            guard.update(&headers);
            let body = response.bytes().await?.to_vec();

            tracing::debug!(
                route = %route,
                status = status.as_u16(),
                bucket = %key,
                remaining = ?headers.remaining,
                "Request completed"
            );

            if status.is_success() {
                return Ok(body);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let limited: Option<RateLimitedBody> = serde_json::from_slice(&body).ok();
                let retry_after = limited
                    .as_ref()
                    .map(|limited| limited.retry_after)
                    .or(headers.retry_after)
                    .unwrap_or(1.0);
                let global = headers.global || limited.is_some_and(|limited| limited.global);

                if global {
                    limiter.set_global_lock(secs(retry_after));
                } else {
                    guard.deplete_for(secs(retry_after));
                }
                drop(guard);

                if attempt >= max_retries {
                    return Err(HttpError::RateLimited {
                        route: route.to_string(),
                        retry_after,
                        global,
                    });
                }
                tracing::warn!(
                    route = %route,
                    bucket = %key,
                    attempt,
                    retry_after,
                    global,
                    "Rate limited, retrying"
                );
                attempt += 1;
                continue;
            }

            drop(guard);

            if is_retryable_server_error(status) {
                if attempt >= max_retries {
                    return Err(HttpError::Server {
                        status: status.as_u16(),
                        message: String::from_utf8_lossy(&body).into_owned(),
                    });
                }
                let delay = self.server_error_delay(attempt);
                tracing::warn!(
                    route = %route,
                    status = status.as_u16(),
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Server error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return Err(error_for_status(status, &body));
        }
    }

    /// Download a resource by absolute URL, without authorization or buckets
    pub async fn get_bytes(&self, url: &str) -> HttpResult<Vec<u8>> {
        let response = self.inner.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();

        if status.is_success() {
            Ok(body)
        } else {
            Err(error_for_status(status, &body))
        }
    }

    /// `GET /gateway`
    pub async fn get_gateway(&self) -> HttpResult<GatewayInfo> {
        self.request(Route::new(Method::GET, "/gateway"), RequestOptions::default())
            .await
    }

    /// `GET /gateway/bot`, including the recommended shard count
    pub async fn get_gateway_bot(&self) -> HttpResult<GatewayBotInfo> {
        self.request(Route::new(Method::GET, "/gateway/bot"), RequestOptions::default())
            .await
    }

    fn build(&self, method: &Method, url: &Url, options: &RequestOptions) -> reqwest::RequestBuilder {
        let mut request = self
            .inner
            .client
            .request(method.clone(), url.clone())
            .header(AUTHORIZATION, format!("Bot {}", self.inner.token));

        if let Some(reason) = &options.reason {
            request = request.header(AUDIT_LOG_REASON, encode_reason(reason));
        }
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if let Some(json) = &options.json {
            request = request.json(json);
        }

        request
    }

    fn server_error_delay(&self, attempt: u32) -> Duration {
        self.inner
            .config
            .server_error_backoff()
            .saturating_mul(attempt.saturating_mul(2).saturating_add(1))
    }
}

fn is_retryable_server_error(status: StatusCode) -> bool {
    matches!(status.as_u16(), 500 | 502 | 503 | 504)
}

fn error_for_status(status: StatusCode, body: &[u8]) -> HttpError {
    let api = ApiErrorBody::from_bytes(body);
    match status.as_u16() {
        401 => HttpError::Unauthorized(api),
        403 => HttpError::Forbidden(api),
        404 => HttpError::NotFound(api),
        code if code >= 500 => HttpError::Server {
            status: code,
            message: api.message,
        },
        code => HttpError::BadRequest {
            status: code,
            body: api,
        },
    }
}

/// Percent-encode everything a header value cannot carry verbatim
fn encode_reason(reason: &str) -> String {
    let mut out = String::with_capacity(reason.len());
    for byte in reason.bytes() {
        if (0x20..0x7F).contains(&byte) && byte != b'%' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
