//! Named limiters, one per external API.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::limiter::RateLimiter;
use crate::config::{limiter_key, LimiterConfig, PacerConfig};
use crate::error::{PacerError, Result};

/// A set of independent limiters addressed by name.
///
/// Limiters are created from configuration up front; names that were not
/// configured can be created lazily from the default settings. Names are
/// case-insensitive and stored lowercased.
pub struct LimiterRegistry {
    limiters: DashMap<String, Arc<RateLimiter>>,
    defaults: LimiterConfig,
}

impl LimiterRegistry {
    /// Create an empty registry whose lazily created limiters use `defaults`.
    pub fn new(defaults: LimiterConfig) -> Result<Self> {
        defaults.validate()?;
        Ok(Self {
            limiters: DashMap::new(),
            defaults,
        })
    }

    /// Build a registry with every limiter named in the configuration.
    pub fn from_config(config: &PacerConfig) -> Result<Self> {
        config.validate()?;
        let registry = Self::new(config.defaults.clone())?;
        for (name, limiter_config) in &config.limiters {
            registry.insert(name, RateLimiter::from_validated(name, limiter_config));
        }
        info!(limiters = registry.len(), "Limiter registry initialized");
        Ok(registry)
    }

    /// Register a limiter, replacing any existing one with the same name.
    ///
    /// Work already queued on a replaced limiter still completes.
    pub fn insert(&self, name: &str, limiter: RateLimiter) -> Arc<RateLimiter> {
        let limiter = Arc::new(limiter);
        self.limiters.insert(limiter_key(name), Arc::clone(&limiter));
        limiter
    }

    /// Look up a configured limiter.
    pub fn get(&self, name: &str) -> Result<Arc<RateLimiter>> {
        self.limiters
            .get(&limiter_key(name))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PacerError::UnknownLimiter(name.to_string()))
    }

    /// Look up a limiter, creating it from the default settings if absent.
    pub fn get_or_default(&self, name: &str) -> Arc<RateLimiter> {
        let key = limiter_key(name);
        let entry = self.limiters.entry(key.clone()).or_insert_with(|| {
            debug!(limiter = %key, "Creating limiter from defaults");
            // Defaults were validated in `new`.
            Arc::new(RateLimiter::from_validated(&key, &self.defaults))
        });
        Arc::clone(entry.value())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Effective settings of every registered limiter, keyed by name.
    pub fn resolved(&self) -> BTreeMap<String, LimiterConfig> {
        self.limiters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().config()))
            .collect()
    }

    /// Number of registered limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Returns `true` if no limiters are registered.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
