//! Target writer seam
//!
//! The real persistence path (SQL dialects, transactions) lives outside this
//! crate. The pipeline drives it through [`TargetWriter`], and filters reach
//! the writer of the active batch through [`BatchContext::writer`].
//!
//! [`BatchContext::writer`]: crate::context::BatchContext::writer

use crate::error::Result;
use crate::message::{BatchInfo, ChangeEvent, TableDescriptor};
use async_trait::async_trait;

/// Persistence path for rows the filter chain lets through
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Open the unit of work for a batch
    async fn begin(&self, batch: &BatchInfo) -> Result<()>;

    /// Persist one row
    async fn write(
        &self,
        batch: &BatchInfo,
        table: &TableDescriptor,
        event: &ChangeEvent,
    ) -> Result<()>;

    /// Make the batch durable
    async fn commit(&self, batch: &BatchInfo) -> Result<()>;

    /// Discard the batch
    async fn rollback(&self, batch: &BatchInfo) -> Result<()>;

    /// Writer name for logging
    fn name(&self) -> &'static str;
}
