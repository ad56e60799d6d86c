//! # Sync Filter Loader
//!
//! Drives change batches through the filter pipeline into a target writer.
//!
//! ## Batch lifecycle
//!
//! Every attempt at a batch gets a fresh [`BatchContext`] carrying the writer:
//!
//! - `begin` on the writer
//! - per row: `before_write` on the chain, then `write` and `after_write`
//!   when every filter allowed the row
//! - `batch_complete` on the chain, `commit` on the writer, `batch_committed`
//! - on any failure: `rollback` on the writer and `batch_rolled_back`
//!
//! Failed batches whose error is retryable are replayed as a whole with
//! exponential backoff, so accumulated artifacts are rebuilt from scratch.

pub mod retry;
pub mod source;
pub mod writer;

pub use retry::*;
pub use source::*;
pub use writer::*;

use futures::{future, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use sync_filter_core::prelude::*;
use sync_filter_core::{
    ErrorContext, ErrorContextExt, LatencyTimer, PipelineMetrics, ProcessorConfig,
};
use tracing::{debug, error, info, warn};

/// Result of one successfully committed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub batch_id: u64,
    pub rows: u64,
    pub rows_written: u64,
    pub rows_suppressed: u64,
    pub attempts: u32,
}

impl BatchOutcome {
    fn new(batch_id: u64) -> Self {
        Self {
            batch_id,
            ..Default::default()
        }
    }
}

/// Totals over a run of many batches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches_ok: u64,
    pub batches_failed: u64,
    pub rows: u64,
    pub rows_written: u64,
    pub rows_suppressed: u64,
}

impl RunSummary {
    fn record(&mut self, result: &Result<BatchOutcome>) {
        match result {
            Ok(outcome) => {
                self.batches_ok += 1;
                self.rows += outcome.rows;
                self.rows_written += outcome.rows_written;
                self.rows_suppressed += outcome.rows_suppressed;
            }
            Err(_) => self.batches_failed += 1,
        }
    }
}

/// Batch orchestrator
pub struct BatchProcessor<W>
where
    W: TargetWriter,
{
    registry: Arc<FilterRegistry>,
    writer: Arc<W>,
    retry: RetryPolicy,
    concurrency: usize,
    metrics: PipelineMetrics,
    running: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl<W> BatchProcessor<W>
where
    W: TargetWriter + 'static,
{
    /// Create new processor
    pub fn new(registry: FilterRegistry, writer: W, config: &ProcessorConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            writer: Arc::new(writer),
            retry: RetryPolicy::from(&config.retry),
            concurrency: config.concurrency.max(1),
            metrics: PipelineMetrics::new("batch_processor"),
            running: AtomicBool::new(true),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Process one batch, replaying it while the failure is retryable
    pub async fn process(&self, batch: &Batch) -> Result<BatchOutcome> {
        let info = &batch.info;
        let _timer = LatencyTimer::start(|d| self.metrics.record_batch_latency(d));
        let mut attempt = 1;

        loop {
            match self.process_once(batch).await {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_batch("committed");
                    debug!(
                        batch_id = info.batch_id,
                        rows = outcome.rows,
                        written = outcome.rows_written,
                        suppressed = outcome.rows_suppressed,
                        attempts = attempt,
                        "Batch committed"
                    );
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        batch_id = info.batch_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Batch failed, retrying"
                    );
                    self.metrics.record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_batch("failed");
                    error!(
                        batch_id = info.batch_id,
                        attempts = attempt,
                        error = %e,
                        "Batch failed"
                    );

                    if e.is_retryable() && attempt > 1 {
                        return Err(PipelineError::retry_exhausted(attempt, e));
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One attempt with its own context; the context is dropped on every path
    async fn process_once(&self, batch: &Batch) -> Result<BatchOutcome> {
        let info = &batch.info;
        let chain = self.registry.chain_for(&info.node_group_id);
        let writer: Arc<dyn TargetWriter> = self.writer.clone();
        let mut ctx = BatchContext::new(info.clone()).with_writer(writer);

        let result = async {
            self.writer
                .begin(info)
                .await
                .with_context(Self::error_context("begin", info))?;
            let outcome = self.load(chain, &mut ctx, batch).await?;
            self.writer
                .commit(info)
                .await
                .with_context(Self::error_context("commit", info))?;
            Ok::<_, PipelineError>(outcome)
        }
        .await;

        match result {
            Ok(outcome) => {
                // Already durable; a failing hook cannot undo the commit.
                if let Err(e) = chain.batch_committed(&mut ctx).await {
                    warn!(batch_id = info.batch_id, error = %e, "batch_committed hook failed");
                }
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = self.writer.rollback(info).await {
                    warn!(batch_id = info.batch_id, error = %rollback_err, "Rollback failed");
                }
                chain.batch_rolled_back(&mut ctx).await;
                Err(e)
            }
        }
    }

    async fn load(
        &self,
        chain: &FilterChain,
        ctx: &mut BatchContext,
        batch: &Batch,
    ) -> Result<BatchOutcome> {
        let info = &batch.info;
        let mut outcome = BatchOutcome::new(info.batch_id);

        for event in &batch.events {
            let table = batch.descriptor(&event.table);
            outcome.rows += 1;
            self.metrics.record_row(&event.table, event.kind.as_code());

            if chain.before_write(ctx, &table, event)? {
                let context =
                    Self::error_context("write", info).with_table(table.qualified_name());
                self.writer.write(info, &table, event).await.with_context(context)?;
                chain.after_write(ctx, &table, event)?;
                outcome.rows_written += 1;
            } else {
                outcome.rows_suppressed += 1;
                self.metrics.record_suppressed(&event.table);
            }
        }

        chain.batch_complete(ctx).await?;
        self.metrics.record_written(outcome.rows_written);
        Ok(outcome)
    }

    fn error_context(operation: &str, info: &BatchInfo) -> ErrorContext {
        ErrorContext::new("batch_processor", operation)
            .with_batch(info.batch_id, &info.node_group_id)
    }

    /// Process a stream of batches, up to `concurrency` at a time. Failed
    /// batches are counted and logged; the run continues.
    pub async fn run(&self, batches: BatchStream) -> RunSummary {
        info!(
            writer = self.writer.name(),
            filters = self.registry.len(),
            concurrency = self.concurrency,
            "Starting batch processor"
        );

        let summary = batches
            .take_while(|_| future::ready(self.is_running()))
            .map(|item| async move {
                match item {
                    Ok(batch) => self.process(&batch).await,
                    Err(e) => {
                        error!(error = %e, "Unreadable batch");
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        Err(e)
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .fold(RunSummary::default(), |mut summary, result| {
                summary.record(&result);
                future::ready(summary)
            })
            .await;

        info!(
            processed = self.processed_count(),
            failed = self.failed_count(),
            rows = summary.rows,
            written = summary.rows_written,
            suppressed = summary.rows_suppressed,
            "Batch processor stopped"
        );
        summary
    }

    /// Stop taking new batches; batches in flight finish
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Check if running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get committed batch count
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Get failed batch count
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn writer(&self) -> &Arc<W> {
        &self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use sync_filter_core::{MemoryPublisher, TemplateComposer};

    #[derive(Default)]
    struct RecordingWriter {
        journal: Mutex<Vec<String>>,
        fail_commits: AtomicU32,
        /// Fail the n-th write call (1-based); zero never fails
        fail_write_at: u32,
        writes: AtomicU32,
    }

    impl RecordingWriter {
        fn failing_commits(count: u32) -> Self {
            Self {
                fail_commits: AtomicU32::new(count),
                ..Default::default()
            }
        }

        fn failing_write(at: u32) -> Self {
            Self {
                fail_write_at: at,
                ..Default::default()
            }
        }

        fn journal(&self) -> Vec<String> {
            self.journal.lock().clone()
        }

        fn log(&self, entry: String) {
            self.journal.lock().push(entry);
        }
    }

    #[async_trait]
    impl TargetWriter for RecordingWriter {
        async fn begin(&self, batch: &BatchInfo) -> Result<()> {
            self.log(format!("begin:{}", batch.batch_id));
            Ok(())
        }

        async fn write(
            &self,
            batch: &BatchInfo,
            table: &TableDescriptor,
            _event: &ChangeEvent,
        ) -> Result<()> {
            let call = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_write_at {
                self.log(format!("write_failed:{}:{}", batch.batch_id, table.name));
                return Err(PipelineError::writer("constraint violation"));
            }
            self.log(format!("write:{}:{}", batch.batch_id, table.name));
            Ok(())
        }

        async fn commit(&self, batch: &BatchInfo) -> Result<()> {
            let remaining = self.fail_commits.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_commits.store(remaining - 1, Ordering::SeqCst);
                self.log(format!("commit_failed:{}", batch.batch_id));
                return Err(PipelineError::writer("connection reset"));
            }
            self.log(format!("commit:{}", batch.batch_id));
            Ok(())
        }

        async fn rollback(&self, batch: &BatchInfo) -> Result<()> {
            self.log(format!("rollback:{}", batch.batch_id));
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    /// Publisher that fails a fixed number of times before delegating
    struct FlakyPublisher {
        failures: AtomicU32,
        inner: Arc<MemoryPublisher>,
    }

    #[async_trait]
    impl Publisher for FlakyPublisher {
        async fn publish(&self, ctx: &BatchContext, text: String) -> Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(PipelineError::publish("flaky", "sink unavailable"));
            }
            self.inner.publish(ctx, text).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    struct BrokenFilter;

    #[async_trait]
    impl DataFilter for BrokenFilter {
        fn name(&self) -> &str {
            "broken"
        }

        fn before_write(
            &self,
            _ctx: &mut BatchContext,
            _table: &TableDescriptor,
            _event: &ChangeEvent,
        ) -> Result<bool> {
            Err(PipelineError::compose("bad template"))
        }
    }

    /// Notes the writer visible through the context on every row
    #[derive(Default)]
    struct WriterNameFilter {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DataFilter for WriterNameFilter {
        fn name(&self) -> &str {
            "writer_name"
        }

        fn before_write(
            &self,
            ctx: &mut BatchContext,
            _table: &TableDescriptor,
            _event: &ChangeEvent,
        ) -> Result<bool> {
            let name = ctx.writer().map_or("none", |w| w.name());
            self.seen.lock().push(name.to_string());
            Ok(true)
        }
    }

    fn config(max_attempts: u32) -> ProcessorConfig {
        let mut config = ProcessorConfig::default();
        config.retry.max_attempts = max_attempts;
        config.retry.initial_backoff = Duration::ZERO;
        config
    }

    fn accumulator(publisher: Arc<dyn Publisher>, load: bool) -> FilterBinding {
        let filter = AccumulatingFilter::new(
            "orders_log",
            Box::new(TemplateComposer::new("<{batch_id}>", "</{batch_id}>")),
            publisher,
        )
        .for_table("ORDERS")
        .load_data_in_target_database(load);
        FilterBinding::new(filter).for_groups(["store"])
    }

    fn orders_batch(batch_id: u64) -> Batch {
        Batch::new(BatchInfo::new(batch_id, "store"))
            .with_event(ChangeEvent::insert("ORDERS").with_value("id", batch_id * 10 + 1))
            .with_event(ChangeEvent::insert("CUSTOMERS").with_value("id", 7))
            .with_event(ChangeEvent::update("ORDERS").with_value("id", batch_id * 10 + 2))
    }

    #[tokio::test]
    async fn test_suppressed_rows_still_publish_artifact() {
        // The load flag answers for every row in the group, matching or not.
        let publisher = MemoryPublisher::new();
        let registry = FilterRegistry::builder()
            .register(accumulator(publisher.clone(), false))
            .build();
        let processor = BatchProcessor::new(registry, RecordingWriter::default(), &config(1));

        let outcome = processor.process(&orders_batch(1)).await.unwrap();

        let expected = BatchOutcome {
            batch_id: 1,
            rows: 3,
            rows_written: 0,
            rows_suppressed: 3,
            attempts: 1,
        };
        assert_eq!(outcome, expected);
        assert_eq!(processor.writer().journal(), vec!["begin:1", "commit:1"]);

        let texts = publisher.texts().await;
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("<1>"));
        assert!(texts[0].ends_with("</1>"));
        assert!(texts[0].contains("id=11"));
        assert!(texts[0].contains("id=12"));
        assert!(!texts[0].contains("CUSTOMERS"));
    }

    #[tokio::test]
    async fn test_retry_rebuilds_artifact_after_publish_failure() {
        let memory = MemoryPublisher::new();
        let publisher = Arc::new(FlakyPublisher {
            failures: AtomicU32::new(1),
            inner: memory.clone(),
        });
        let registry = FilterRegistry::builder().register(accumulator(publisher, true)).build();
        let processor = BatchProcessor::new(registry, RecordingWriter::default(), &config(3));

        let outcome = processor.process(&orders_batch(4)).await.unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.rows_written, 3);

        let journal = processor.writer().journal();
        assert_eq!(journal.iter().filter(|e| *e == "rollback:4").count(), 1);
        assert_eq!(journal.last().map(String::as_str), Some("commit:4"));

        let texts = memory.texts().await;
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].matches("id=41").count(), 1);
        assert_eq!(texts[0].matches("<4>").count(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted_on_commit_failure() {
        let publisher = MemoryPublisher::new();
        let registry = FilterRegistry::builder()
            .register(accumulator(publisher.clone(), true))
            .build();
        let writer = RecordingWriter::failing_commits(5);
        let processor = BatchProcessor::new(registry, writer, &config(2));

        let err = processor.process(&orders_batch(2)).await.unwrap_err();

        assert!(matches!(err, PipelineError::RetryExhausted { attempts: 2, .. }));
        assert!(matches!(err.root_cause(), PipelineError::Writer { .. }));
        assert_eq!(processor.failed_count(), 1);
        assert_eq!(processor.processed_count(), 0);
        // Publication happens at batch completion, before the commit.
        assert_eq!(publisher.len().await, 2);
    }

    #[tokio::test]
    async fn test_writer_failure_mid_batch_discards_partial_text() {
        let publisher = MemoryPublisher::new();
        let registry = FilterRegistry::builder()
            .register(accumulator(publisher.clone(), true))
            .build();
        let writer = RecordingWriter::failing_write(2);
        let processor = BatchProcessor::new(registry, writer, &config(1));

        // The first ORDERS row is accumulated before the second write fails.
        let err = processor.process(&orders_batch(5)).await.unwrap_err();

        assert!(matches!(err, PipelineError::Writer { .. }));
        assert_eq!(
            processor.writer().journal(),
            vec!["begin:5", "write:5:ORDERS", "write_failed:5:CUSTOMERS", "rollback:5"]
        );
        assert!(publisher.is_empty().await);
    }

    #[tokio::test]
    async fn test_filter_error_aborts_without_retry() {
        let publisher = MemoryPublisher::new();
        let registry = FilterRegistry::builder()
            .register(FilterBinding::new(BrokenFilter))
            .register(accumulator(publisher.clone(), true))
            .build();
        let processor = BatchProcessor::new(registry, RecordingWriter::default(), &config(3));

        let err = processor.process(&orders_batch(3)).await.unwrap_err();

        match err {
            PipelineError::FilterAborted { batch_id, ref filter, .. } => {
                assert_eq!(batch_id, 3);
                assert_eq!(filter, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(processor.writer().journal(), vec!["begin:3", "rollback:3"]);
        assert!(publisher.is_empty().await);
    }

    #[tokio::test]
    async fn test_context_exposes_active_writer() {
        let filter = Arc::new(WriterNameFilter::default());
        let registry = FilterRegistry::builder()
            .register(FilterBinding::from_arc(filter.clone()))
            .build();
        let processor = BatchProcessor::new(registry, RecordingWriter::default(), &config(1));

        processor.process(&orders_batch(6)).await.unwrap();

        assert_eq!(*filter.seen.lock(), vec!["recording"; 3]);
    }

    #[tokio::test]
    async fn test_other_group_bypasses_group_filters() {
        let publisher = MemoryPublisher::new();
        let registry = FilterRegistry::builder()
            .register(accumulator(publisher.clone(), false))
            .build();
        let processor = BatchProcessor::new(registry, RecordingWriter::default(), &config(1));

        let batch = Batch::new(BatchInfo::new(9, "warehouse"))
            .with_event(ChangeEvent::insert("ORDERS").with_value("id", 1));
        let outcome = processor.process(&batch).await.unwrap();

        assert_eq!(outcome.rows_written, 1);
        assert!(publisher.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_batches_publish_isolated_artifacts() {
        let publisher = MemoryPublisher::new();
        let registry = FilterRegistry::builder()
            .register(accumulator(publisher.clone(), false))
            .build();
        let mut config = config(1);
        config.concurrency = 4;
        let processor = BatchProcessor::new(registry, RecordingWriter::default(), &config);

        let batches = (1..=8).map(orders_batch).collect();
        let summary = processor.run(from_batches(batches)).await;

        let expected = RunSummary {
            batches_ok: 8,
            batches_failed: 0,
            rows: 24,
            rows_written: 0,
            rows_suppressed: 24,
        };
        assert_eq!(summary, expected);

        let publications = publisher.publications().await;
        assert_eq!(publications.len(), 8);
        for publication in publications {
            let id = publication.batch_id;
            assert!(publication.text.starts_with(&format!("<{id}>")));
            assert!(publication.text.contains(&format!("id={}", id * 10 + 1)));
            assert!(publication.text.contains(&format!("id={}", id * 10 + 2)));
            assert_eq!(publication.text.matches("ORDERS").count(), 2);
        }
    }

    #[tokio::test]
    async fn test_stopped_processor_takes_no_batches() {
        let registry = FilterRegistry::builder().build();
        let processor = BatchProcessor::new(registry, RecordingWriter::default(), &config(1));
        processor.stop();

        let summary = processor.run(from_batches(vec![orders_batch(1)])).await;

        assert_eq!(summary, RunSummary::default());
        assert!(processor.writer().journal().is_empty());
    }
}
