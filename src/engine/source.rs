//! Durable configuration collaborators.
//!
//! The engine only ever reads from a [`ConfigSource`], at start and on each
//! reload; where the records live is the source's business.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;

use crate::types::{Config, Error, ProductionConfig, Result};

/// Supplies the item graph.
#[async_trait]
pub trait ConfigSource: Send + Sync + fmt::Debug {
    /// Load and validate the current graph.
    async fn load(&self) -> Result<ProductionConfig>;
}

/// Reads the `production` section of a JSON config file on every load.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for JsonFileSource {
    async fn load(&self) -> Result<ProductionConfig> {
        let path = self.path.clone();
        let config = tokio::task::spawn_blocking(move || Config::from_json_file(path))
            .await
            .map_err(|e| Error::internal(format!("config load task failed: {}", e)))??;
        Ok(config.production)
    }
}

/// In-memory source, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticSource {
    current: Mutex<ProductionConfig>,
}

impl StaticSource {
    pub fn new(production: ProductionConfig) -> Self {
        Self {
            current: Mutex::new(production),
        }
    }

    /// Replace what the next `load` returns.
    pub fn set(&self, production: ProductionConfig) {
        *self.current.lock() = production;
    }
}

#[async_trait]
impl ConfigSource for StaticSource {
    async fn load(&self) -> Result<ProductionConfig> {
        let production = self.current.lock().clone();
        production.validate()?;
        Ok(production)
    }
}
