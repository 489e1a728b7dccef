//! Persistence layer
//!
//! The core treats storage as fire-and-forget: every insert is
//! best-effort, failures are logged by the caller and never propagate
//! into trade or ticker processing.

mod parquet;

pub use parquet::{ParquetStore, StoreConfig, StoreStats};

use crate::feed::{GreeksSnapshot, Trade};
use crate::filter::VolatilityEvent;
use crate::surface::SurfaceFit;
use crate::tracker::ChainSnapshot;
use async_trait::async_trait;

/// Storage collaborator interface
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_trade(&self, trade: &Trade) -> anyhow::Result<()>;
    async fn insert_volatility_event(&self, event: &VolatilityEvent) -> anyhow::Result<()>;
    async fn insert_greeks_snapshot(&self, snapshot: &GreeksSnapshot) -> anyhow::Result<()>;
    async fn insert_chain_snapshot(&self, snapshot: &ChainSnapshot) -> anyhow::Result<()>;
    async fn insert_surface_fit(&self, fit: &SurfaceFit) -> anyhow::Result<()>;
}

/// No-op store for tests and capture-disabled runs
pub struct NullStore;

#[async_trait]
impl Persistence for NullStore {
    async fn insert_trade(&self, _trade: &Trade) -> anyhow::Result<()> {
        Ok(())
    }

    async fn insert_volatility_event(&self, _event: &VolatilityEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn insert_greeks_snapshot(&self, _snapshot: &GreeksSnapshot) -> anyhow::Result<()> {
        Ok(())
    }

    async fn insert_chain_snapshot(&self, _snapshot: &ChainSnapshot) -> anyhow::Result<()> {
        Ok(())
    }

    async fn insert_surface_fit(&self, _fit: &SurfaceFit) -> anyhow::Result<()> {
        Ok(())
    }
}
