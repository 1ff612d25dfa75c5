//! Named rate limit policies.
//!
//! A policy binds a [`LimitRule`] to the strategy that picks the key a request
//! is counted under, plus how a denial is reported. Policies are resolved once
//! at startup and can be swapped as a whole at runtime.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::keys::KeyStrategy;
use crate::config::{GateConfig, HttpConfig};
use crate::error::{GateError, Result};
use crate::ratelimit::{LimitRule, TimeUnit};

/// Name of the policy built from the `defaults` section.
pub const DEFAULT_POLICY: &str = "default";

/// Separates a policy name from the request key in counter keys. Policy
/// names may not contain it, so a scoped key always splits at its first one.
pub const SCOPE_SEPARATOR: char = ':';

/// Status returned for denied requests unless a policy says otherwise.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// A policy as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Unique policy name
    #[serde(default = "default_name")]
    pub name: String,
    /// Hits allowed per window
    #[serde(default = "default_permits")]
    pub permits: u64,
    /// Window length, in `unit`s
    #[serde(default = "default_window")]
    pub window: u32,
    /// Unit for `window`
    #[serde(default = "default_unit")]
    pub unit: TimeUnit,
    /// How the request key is resolved
    #[serde(default)]
    pub strategy: KeyStrategy,
    /// Status code for denials
    #[serde(default = "default_status")]
    pub status: u16,
    /// Overrides `http.send_headers` for this policy
    #[serde(default)]
    pub send_headers: Option<bool>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            permits: default_permits(),
            window: default_window(),
            unit: default_unit(),
            strategy: KeyStrategy::default(),
            status: default_status(),
            send_headers: None,
        }
    }
}

fn default_name() -> String {
    DEFAULT_POLICY.to_string()
}

fn default_permits() -> u64 {
    60
}

fn default_window() -> u32 {
    1
}

fn default_unit() -> TimeUnit {
    TimeUnit::Minute
}

fn default_status() -> u16 {
    TOO_MANY_REQUESTS
}

impl PolicyConfig {
    /// The rule this policy enforces.
    pub fn rule(&self) -> LimitRule {
        LimitRule::per(self.permits, self.window, self.unit)
    }

    /// Check the policy can be enforced.
    pub fn validate(&self) -> Result<()> {
        check_name(&self.name).map_err(GateError::Config)?;

        self.rule()
            .validate()
            .map_err(|e| GateError::Config(format!("policy {}: {}", self.name, e)))?;

        if !(400..=599).contains(&self.status) {
            return Err(GateError::Config(format!(
                "policy {}: status {} is not an error status",
                self.name, self.status
            )));
        }

        Ok(())
    }
}

/// A resolved policy ready to be enforced.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub name: String,
    pub rule: LimitRule,
    pub strategy: KeyStrategy,
    pub status: u16,
    pub send_headers: bool,
}

impl Policy {
    /// Create a policy with a 429 denial status and headers enabled.
    ///
    /// Fails when `name` is blank or contains [`SCOPE_SEPARATOR`].
    pub fn new(name: impl Into<String>, rule: LimitRule, strategy: KeyStrategy) -> Result<Self> {
        let name = name.into();
        check_name(&name).map_err(GateError::InvalidArgument)?;

        Ok(Self {
            name,
            rule,
            strategy,
            status: TOO_MANY_REQUESTS,
            send_headers: true,
        })
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_headers(mut self, send_headers: bool) -> Self {
        self.send_headers = send_headers;
        self
    }

    /// Resolve a configured policy against the shared HTTP settings.
    pub fn from_config(config: &PolicyConfig, http: &HttpConfig) -> Self {
        Self {
            name: config.name.clone(),
            rule: config.rule(),
            strategy: config.strategy.clone(),
            status: config.status,
            send_headers: config.send_headers.unwrap_or(http.send_headers),
        }
    }

    /// Namespace a resolved request key so policies never share counters.
    pub fn scoped_key(&self, resolved: &str) -> String {
        format!("{}{}{}", self.name, SCOPE_SEPARATOR, resolved)
    }
}

/// A policy name must be non-blank and free of [`SCOPE_SEPARATOR`].
pub(crate) fn check_name(name: &str) -> std::result::Result<(), String> {
    if name.trim().is_empty() {
        return Err("policy name must not be empty".to_string());
    }
    if name.contains(SCOPE_SEPARATOR) {
        return Err(format!(
            "policy name {:?} must not contain '{}'",
            name, SCOPE_SEPARATOR
        ));
    }
    Ok(())
}

/// Thread-safe set of named policies.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, Arc<Policy>>>,
}

impl PolicyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry described by a configuration, including the default policy.
    pub fn from_config(config: &GateConfig) -> Result<Self> {
        config.validate()?;

        let registry = Self::new();
        registry.replace(Self::resolve_all(config));

        info!(policies = registry.len(), "Rate limit policies loaded");
        Ok(registry)
    }

    fn resolve_all(config: &GateConfig) -> Vec<Policy> {
        let mut defaults = Policy::from_config(&config.defaults, &config.http);
        defaults.name = DEFAULT_POLICY.to_string();

        std::iter::once(defaults)
            .chain(
                config
                    .policies
                    .iter()
                    .map(|p| Policy::from_config(p, &config.http)),
            )
            .collect()
    }

    /// Get a policy by name.
    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies.read().get(name).cloned()
    }

    /// Add or overwrite a single policy.
    pub fn insert(&self, policy: Policy) {
        self.policies.write().insert(policy.name.clone(), Arc::new(policy));
    }

    /// Atomically swap the whole policy set.
    pub fn replace(&self, policies: impl IntoIterator<Item = Policy>) {
        let next: HashMap<_, _> = policies
            .into_iter()
            .map(|p| (p.name.clone(), Arc::new(p)))
            .collect();
        *self.policies.write() = next;
    }

    /// Reload from a new configuration, keeping the old set if it is invalid.
    pub fn reload(&self, config: &GateConfig) -> Result<()> {
        config.validate()?;
        self.replace(Self::resolve_all(config));
        info!(policies = self.len(), "Rate limit policies reloaded");
        Ok(())
    }

    /// Names of all registered policies, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }
}
