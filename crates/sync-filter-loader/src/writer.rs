//! Target writer strategies

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use sync_filter_core::prelude::*;
use tracing::debug;

/// Writer that only logs what it would persist
#[derive(Debug, Default)]
pub struct TracingWriter {
    written: AtomicU64,
    committed: AtomicU64,
}

impl TracingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written_count(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn committed_count(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TargetWriter for TracingWriter {
    async fn begin(&self, batch: &BatchInfo) -> Result<()> {
        debug!(batch_id = batch.batch_id, channel = %batch.channel, "Begin batch");
        Ok(())
    }

    async fn write(
        &self,
        batch: &BatchInfo,
        table: &TableDescriptor,
        event: &ChangeEvent,
    ) -> Result<()> {
        debug!(
            batch_id = batch.batch_id,
            table = %table.qualified_name(),
            kind = %event.kind,
            columns = event.values.len(),
            "Write row"
        );
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn commit(&self, batch: &BatchInfo) -> Result<()> {
        debug!(batch_id = batch.batch_id, "Commit batch");
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(&self, batch: &BatchInfo) -> Result<()> {
        debug!(batch_id = batch.batch_id, "Rollback batch");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}
