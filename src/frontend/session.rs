//! Session cookie handling for sticky sessions.

use crate::config::SessionAffinityConfig;
use hyper::header::{HeaderMap, HeaderValue, COOKIE};
use std::time::Duration;

/// Name and lifetime of the affinity cookie.
#[derive(Debug, Clone)]
pub struct SessionCookie {
    pub name: String,
    pub ttl: Duration,
}

impl SessionCookie {
    /// `None` when session affinity is disabled.
    pub fn from_config(config: &SessionAffinityConfig) -> Option<Self> {
        config.enabled.then(|| Self {
            name: config.cookie_name.clone(),
            ttl: config.ttl,
        })
    }

    /// The session id carried by the request, if any.
    pub fn extract(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, value)| *name == self.name && !value.is_empty())
            .map(|(_, value)| value.to_string())
    }

    /// `Set-Cookie` value binding the client to `session_id`.
    pub fn set_cookie(&self, session_id: &str) -> Option<HeaderValue> {
        let value = format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly",
            self.name,
            session_id,
            self.ttl.as_secs()
        );
        HeaderValue::from_str(&value).ok()
    }
}
