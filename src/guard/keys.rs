//! Rate-limit key resolution from request attributes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Fallback keys used when the chosen attribute is missing.
pub const NO_COOKIE: &str = "nocookie";
pub const NO_HEADER: &str = "noheader";
pub const NO_USER: &str = "nouser";
pub const UNKNOWN_IP: &str = "unknown";

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Minimal view of an incoming request, independent of any HTTP framework.
pub trait RequestContext {
    /// Peer address of the connection.
    fn remote_addr(&self) -> Option<&str>;

    /// First value of a header. Lookup is case-insensitive.
    fn header(&self, name: &str) -> Option<&str>;

    /// Value of a cookie.
    fn cookie(&self, name: &str) -> Option<&str>;

    /// Identifier of the authenticated user.
    fn user_id(&self) -> Option<&str>;
}

/// Caller-supplied key function for [`KeyStrategy::Custom`].
#[derive(Clone)]
pub struct CustomKeyFn(Arc<dyn Fn(&dyn RequestContext) -> Option<String> + Send + Sync>);

impl CustomKeyFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&dyn RequestContext) -> Option<String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl std::fmt::Debug for CustomKeyFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CustomKeyFn")
    }
}

/// How a request is mapped to the key it is limited under.
///
/// Configuration files can name every strategy except `Custom`, which is
/// only available to code building policies directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "arg", rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Client IP, honoring proxy headers when trusted
    #[default]
    Ip,
    /// Value of the named header
    Header(String),
    /// Value of the named cookie
    Cookie(String),
    /// Authenticated user identifier
    User,
    /// Key computed by application code; `None` skips limiting
    #[serde(skip)]
    Custom(CustomKeyFn),
}

impl PartialEq for KeyStrategy {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (KeyStrategy::Ip, KeyStrategy::Ip) => true,
            (KeyStrategy::User, KeyStrategy::User) => true,
            (KeyStrategy::Header(a), KeyStrategy::Header(b)) => a == b,
            (KeyStrategy::Cookie(a), KeyStrategy::Cookie(b)) => a == b,
            (KeyStrategy::Custom(a), KeyStrategy::Custom(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl KeyStrategy {
    /// Build a custom strategy from a closure.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&dyn RequestContext) -> Option<String> + Send + Sync + 'static,
    {
        KeyStrategy::Custom(CustomKeyFn::new(f))
    }

    /// Short tag used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            KeyStrategy::Ip => "ip",
            KeyStrategy::Header(_) => "header",
            KeyStrategy::Cookie(_) => "cookie",
            KeyStrategy::User => "user",
            KeyStrategy::Custom(_) => "custom",
        }
    }

    /// Resolve the key for a request.
    ///
    /// Built-in strategies always produce a key, falling back to a fixed
    /// placeholder. Only a custom strategy can return `None`.
    pub fn resolve(&self, ctx: &dyn RequestContext, include_forwarded_for: bool) -> Option<String> {
        match self {
            KeyStrategy::Ip => Some(client_ip(ctx, include_forwarded_for)),
            KeyStrategy::Header(name) => Some(
                non_blank(name)
                    .and_then(|name| ctx.header(name))
                    .and_then(non_blank)
                    .unwrap_or(NO_HEADER)
                    .to_string(),
            ),
            KeyStrategy::Cookie(name) => Some(
                non_blank(name)
                    .and_then(|name| ctx.cookie(name))
                    .and_then(non_blank)
                    .unwrap_or(NO_COOKIE)
                    .to_string(),
            ),
            KeyStrategy::User => Some(ctx.user_id().and_then(non_blank).unwrap_or(NO_USER).to_string()),
            KeyStrategy::Custom(f) => (f.0)(ctx).filter(|key| !key.trim().is_empty()),
        }
    }
}

/// Client IP: first X-Forwarded-For hop, then X-Real-IP, then the peer address.
pub fn client_ip(ctx: &dyn RequestContext, include_forwarded_for: bool) -> String {
    if include_forwarded_for {
        let forwarded = ctx
            .header(FORWARDED_FOR)
            .and_then(|xff| xff.split(',').next())
            .and_then(non_blank);
        if let Some(ip) = forwarded {
            return ip.trim().to_string();
        }

        if let Some(ip) = ctx.header(REAL_IP).and_then(non_blank) {
            return ip.trim().to_string();
        }
    }

    ctx.remote_addr()
        .and_then(non_blank)
        .unwrap_or(UNKNOWN_IP)
        .to_string()
}

fn non_blank(value: &str) -> Option<&str> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Owned request snapshot, usable wherever a [`RequestContext`] is needed.
///
/// Cookies not set explicitly are looked up in the `Cookie` header.
#[derive(Debug, Clone, Default)]
pub struct SimpleRequest {
    remote_addr: Option<String>,
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
    user_id: Option<String>,
}

impl SimpleRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user_id = Some(user.into());
        self
    }

    fn cookie_from_header(&self, name: &str) -> Option<&str> {
        self.headers.get("cookie")?.split(';').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k.trim() == name).then(|| v.trim())
        })
    }
}

impl RequestContext for SimpleRequest {
    fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .get(name)
            .map(String::as_str)
            .or_else(|| self.cookie_from_header(name))
    }

    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}
