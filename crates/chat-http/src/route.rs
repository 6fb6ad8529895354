//! Route templates and bucket keys
//!
//! A [`Route`] keeps the unformatted template alongside its parameters. Only
//! the major parameters (channel, guild, webhook) take part in the
//! [`BucketKey`], so routes differing in a minor parameter such as a message
//! id share one rate-limit bucket.

use crate::error::{HttpError, HttpResult};
use chat_core::Snowflake;
use reqwest::Method;
use std::fmt;

/// An API route with its parameters
#[derive(Debug, Clone)]
pub struct Route {
    method: Method,
    template: String,
    channel_id: Option<Snowflake>,
    guild_id: Option<Snowflake>,
    webhook_id: Option<Snowflake>,
    webhook_token: Option<String>,
    params: Vec<(String, String)>,
}

impl Route {
    /// Create a route for a template such as `/channels/{channel_id}/messages/{message_id}`
    pub fn new(method: Method, template: impl Into<String>) -> Self {
        Self {
            method,
            template: template.into(),
            channel_id: None,
            guild_id: None,
            webhook_id: None,
            webhook_token: None,
            params: Vec::new(),
        }
    }

    /// Major parameter `{channel_id}`
    pub fn channel_id(mut self, id: Snowflake) -> Self {
        self.channel_id = Some(id);
        self
    }

    /// Major parameter `{guild_id}`
    pub fn guild_id(mut self, id: Snowflake) -> Self {
        self.guild_id = Some(id);
        self
    }

    /// Major parameters `{webhook_id}` and `{webhook_token}`
    pub fn webhook(mut self, id: Snowflake, token: impl Into<String>) -> Self {
        self.webhook_id = Some(id);
        self.webhook_token = Some(token.into());
        self
    }

    /// Minor parameter; does not affect the bucket
    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "channel_id" => self.channel_id.map(|id| id.to_string()),
            "guild_id" => self.guild_id.map(|id| id.to_string()),
            "webhook_id" => self.webhook_id.map(|id| id.to_string()),
            "webhook_token" => self.webhook_token.clone(),
            _ => self
                .params
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone()),
        }
    }

    /// Path segments with every placeholder substituted (not yet percent-encoded)
    pub fn segments(&self) -> HttpResult<Vec<String>> {
        self.template
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| self.substitute(segment))
            .collect()
    }

    /// Formatted path, for logging
    pub fn path(&self) -> HttpResult<String> {
        let segments = self.segments()?;
        Ok(format!("/{}", segments.join("/")))
    }

    fn substitute(&self, segment: &str) -> HttpResult<String> {
        let mut out = String::with_capacity(segment.len());
        let mut rest = segment;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                HttpError::InvalidRoute(format!("unclosed placeholder in {}", self.template))
            })?;
            let name = &after[..close];
            let value = self.lookup(name).ok_or_else(|| {
                HttpError::InvalidRoute(format!("missing parameter {name} for {}", self.template))
            })?;
            out.push_str(&value);
            rest = &after[close + 1..];
        }
        out.push_str(rest);

        Ok(out)
    }

    /// Rate-limit bucket this route belongs to
    pub fn bucket_key(&self) -> BucketKey {
        let major = format!(
            "{}:{}:{}",
            self.channel_id.map_or(0, Snowflake::into_inner),
            self.guild_id.map_or(0, Snowflake::into_inner),
            self.webhook_id.map_or(0, Snowflake::into_inner),
        );
        let major = match &self.webhook_token {
            Some(token) => format!("{major}:{token}"),
            None => major,
        };

        BucketKey {
            method: self.method.clone(),
            template: self.template.clone(),
            major,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

/// Method + route template + major parameter values
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    method: Method,
    template: String,
    major: String,
}

impl BucketKey {
    /// Method and template only; what server bucket hashes are learned against
    pub fn route_key(&self) -> String {
        format!("{} {}", self.method, self.template)
    }

    /// Major parameter values, joined
    pub fn major(&self) -> &str {
        &self.major
    }

    /// Key under which bucket state is stored, given a learned server hash
    pub fn resolve(&self, hash: Option<&str>) -> String {
        match hash {
            Some(hash) => format!("{hash}:{}", self.major),
            None => format!("{}:{}", self.route_key(), self.major),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.route_key(), self.major)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGE: &str = "/channels/{channel_id}/messages/{message_id}";

    #[test]
    fn test_path_substitutes_all_params() {
        let route = Route::new(Method::GET, MESSAGE)
            .channel_id(Snowflake::new(10))
            .param("message_id", 99);

        assert_eq!(route.path().unwrap(), "/channels/10/messages/99");
        assert_eq!(route.to_string(), format!("GET {MESSAGE}"));
    }

    #[test]
    fn test_minor_params_share_bucket() {
        let a = Route::new(Method::DELETE, MESSAGE)
            .channel_id(Snowflake::new(10))
            .param("message_id", 1);
        let b = Route::new(Method::DELETE, MESSAGE)
            .channel_id(Snowflake::new(10))
            .param("message_id", 2);

        assert_eq!(a.bucket_key(), b.bucket_key());
        assert_ne!(a.path().unwrap(), b.path().unwrap());
    }

    #[test]
    fn test_major_params_split_buckets() {
        let a = Route::new(Method::GET, MESSAGE)
            .channel_id(Snowflake::new(10))
            .param("message_id", 1);
        let b = Route::new(Method::GET, MESSAGE)
            .channel_id(Snowflake::new(11))
            .param("message_id", 1);

        assert_ne!(a.bucket_key(), b.bucket_key());
    }

    #[test]
    fn test_method_splits_buckets() {
        let get = Route::new(Method::GET, "/guilds/{guild_id}").guild_id(Snowflake::new(5));
        let patch = Route::new(Method::PATCH, "/guilds/{guild_id}").guild_id(Snowflake::new(5));

        assert_ne!(get.bucket_key(), patch.bucket_key());
    }

    #[test]
    fn test_webhook_token_is_major() {
        let template = "/webhooks/{webhook_id}/{webhook_token}";
        let a = Route::new(Method::POST, template).webhook(Snowflake::new(1), "aaa");
        let b = Route::new(Method::POST, template).webhook(Snowflake::new(1), "bbb");

        assert_ne!(a.bucket_key(), b.bucket_key());
        assert_eq!(a.path().unwrap(), "/webhooks/1/aaa");
    }

    #[test]
    fn test_missing_param_is_error() {
        let route = Route::new(Method::GET, MESSAGE).channel_id(Snowflake::new(10));
        assert!(matches!(route.path(), Err(HttpError::InvalidRoute(_))));
    }

    #[test]
    fn test_placeholder_inside_segment() {
        let route = Route::new(Method::PUT, "/channels/{channel_id}/reactions/{emoji}/@me")
            .channel_id(Snowflake::new(3))
            .param("emoji", "name:42");

        assert_eq!(
            route.segments().unwrap(),
            vec!["channels", "3", "reactions", "name:42", "@me"]
        );
    }

    #[test]
    fn test_resolve_with_hash() {
        let key = Route::new(Method::GET, "/guilds/{guild_id}")
            .guild_id(Snowflake::new(5))
            .bucket_key();

        assert_eq!(key.route_key(), "GET /guilds/{guild_id}");
        assert_eq!(key.resolve(Some("abcd")), format!("abcd:{}", key.major()));
        assert_eq!(key.resolve(None), key.to_string());
    }
}
