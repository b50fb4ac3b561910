//! Chef builder with pluggable collaborators
//!
//! The index, ingestor and storage are always supplied by the caller. The
//! lock provider may be supplied too; otherwise it is built from
//! [`LockConfig`](crate::config::LockConfig). The ingestor's sack count must
//! match `sacks.num_sacks`.

use crate::chef::Chef;
use crate::config::{ChefConfig, LockBackend};
use crate::coordination::MemoryLockProvider;
use crate::engine::traits::{LockProvider, MeasureIngestor, MetricIndex, SeriesStore};
use crate::error::{Error, Result, ValidationError};
use crate::redis::RedisLockProvider;
use crate::redis::util::sanitize_url;
use std::sync::Arc;
use tracing::{info, Span};

/// Builder for a [`Chef`]
pub struct ChefBuilder {
    index: Option<Arc<dyn MetricIndex>>,
    ingestor: Option<Arc<dyn MeasureIngestor>>,
    storage: Option<Arc<dyn SeriesStore>>,
    lock_provider: Option<Arc<dyn LockProvider>>,
    span: Option<Span>,
    config: ChefConfig,
}

impl ChefBuilder {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        Self {
            index: None,
            ingestor: None,
            storage: None,
            lock_provider: None,
            span: None,
            config: ChefConfig::default(),
        }
    }

    /// Set the metric index
    pub fn with_index<I>(mut self, index: Arc<I>) -> Self
    where
        I: MetricIndex,
    {
        self.index = Some(index);
        self
    }

    /// Set the measure ingestor
    pub fn with_ingestor<M>(mut self, ingestor: Arc<M>) -> Self
    where
        M: MeasureIngestor,
    {
        self.ingestor = Some(ingestor);
        self
    }

    /// Set the series storage
    pub fn with_storage<S>(mut self, storage: Arc<S>) -> Self
    where
        S: SeriesStore,
    {
        self.storage = Some(storage);
        self
    }

    /// Set the lock provider, overriding `lock.backend`
    pub fn with_lock_provider<L>(mut self, provider: Arc<L>) -> Self
    where
        L: LockProvider,
    {
        self.lock_provider = Some(provider);
        self
    }

    /// Set the chef's logging span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Set the configuration
    pub fn with_config(mut self, config: ChefConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and assemble the chef
    ///
    /// Connects to Redis when the Redis lock backend is selected and no
    /// provider was supplied.
    pub async fn build(self) -> Result<Chef> {
        self.config.validate()?;

        let index = self
            .index
            .ok_or_else(|| Error::Configuration("No metric index configured".to_string()))?;
        let ingestor = self
            .ingestor
            .ok_or_else(|| Error::Configuration("No measure ingestor configured".to_string()))?;
        let storage = self
            .storage
            .ok_or_else(|| Error::Configuration("No series storage configured".to_string()))?;

        // Lock names are per sack, so every worker must agree on the layout
        if ingestor.num_sacks() != self.config.sacks.num_sacks {
            return Err(ValidationError::Mismatch {
                field: "sacks.num_sacks".to_string(),
                value: self.config.sacks.num_sacks.to_string(),
                other: "the ingestor's sack count".to_string(),
                other_value: ingestor.num_sacks().to_string(),
            }
            .into());
        }

        let lock_provider: Arc<dyn LockProvider> = match self.lock_provider {
            Some(provider) => provider,
            None => match self.config.lock.backend {
                LockBackend::Memory => Arc::new(MemoryLockProvider::new()),
                LockBackend::Redis => {
                    info!(
                        url = %sanitize_url(&self.config.lock.redis_url),
                        "Connecting Redis lock backend"
                    );
                    Arc::new(RedisLockProvider::connect(&self.config.lock).await?)
                },
            },
        };

        let mut chef = Chef::new(index, ingestor, storage, lock_provider)
            .with_lock_prefix(self.config.sacks.lock_prefix.clone())
            .with_refresh_timeout(self.config.refresh.default_timeout());
        if let Some(span) = self.span {
            chef = chef.with_span(span);
        }

        info!(
            lock_prefix = %self.config.sacks.lock_prefix,
            refresh_timeout_ms = self.config.refresh.default_timeout_ms,
            "Chef initialized"
        );
        Ok(chef)
    }
}

impl Default for ChefBuilder {
    fn default() -> Self {
        Self::new()
    }
}
