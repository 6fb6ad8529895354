//! # chat-http
//!
//! Rate-limited REST dispatcher.
//!
//! Every request is keyed to a bucket derived from its method, route template
//! and major parameters. Requests within a bucket run strictly one at a time;
//! distinct buckets run concurrently. A global lockout, once set by the
//! service, pauses every bucket until it expires.

pub mod client;
pub mod error;
pub mod models;
pub mod ratelimit;
pub mod route;

pub use client::{HttpClient, RequestOptions};
pub use error::{HttpError, HttpResult};
pub use models::{ApiErrorBody, GatewayBotInfo, GatewayInfo, RateLimitedBody, SessionStartLimit};
pub use ratelimit::{Bucket, BucketGuard, RateLimitHeaders, RateLimiter};
pub use reqwest::Method;
pub use route::{BucketKey, Route};
