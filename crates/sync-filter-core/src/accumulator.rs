//! Accumulating text publisher filter
//!
//! [`AccumulatingFilter`] watches one table and turns every matching data row
//! of a batch into an element of a single text artifact:
//!
//! ```text
//! first matching row ──► header + element
//! further rows       ──► + element
//! batch_complete     ──► + footer ──► Publisher (once)
//! ```
//!
//! The buffer lives in the [`BatchContext`] under a key owned by the filter
//! instance, so batches never see each other's text even when one instance
//! serves several workers. The buffer is taken out of the context before the
//! publisher is called: a second `batch_complete` finds nothing to flush, and
//! a failed publish drops the text and fails the batch.

use crate::composer::TextComposer;
use crate::context::{BatchContext, ContextKey};
use crate::counter::{RateLimitedCounter, DEFAULT_MIN_TIME_BETWEEN_LOG_OUTPUT};
use crate::error::{PipelineError, Result};
use crate::filter::DataFilter;
use crate::message::{ChangeEvent, TableDescriptor};
use crate::metrics::FlushMetrics;
use crate::publisher::Publisher;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Filter that composes one text artifact per batch for a single table.
///
/// A filter without a table name never matches any row and never publishes.
/// This is not reported as an error.
pub struct AccumulatingFilter {
    name: String,
    table_name: Option<String>,
    load_data_in_target_database: bool,
    composer: Box<dyn TextComposer>,
    publisher: Arc<dyn Publisher>,
    counter: RateLimitedCounter,
    buffer_key: ContextKey<String>,
    metrics: FlushMetrics,
}

impl AccumulatingFilter {
    /// Create an unbound filter that lets every row through to the writer
    pub fn new(
        name: impl Into<String>,
        composer: Box<dyn TextComposer>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let name = name.into();
        Self {
            buffer_key: ContextKey::unique(format!("{}.text", name)),
            metrics: FlushMetrics::new(name.clone()),
            name,
            table_name: None,
            load_data_in_target_database: true,
            composer,
            publisher,
            counter: RateLimitedCounter::new(DEFAULT_MIN_TIME_BETWEEN_LOG_OUTPUT),
        }
    }

    /// Builder: table whose rows are accumulated
    pub fn for_table(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    /// Builder: answer returned from every `before_write`
    pub fn load_data_in_target_database(mut self, load: bool) -> Self {
        self.load_data_in_target_database = load;
        self
    }

    /// Builder: minimum time between publish-count summaries
    pub fn min_time_between_log_output(mut self, interval: Duration) -> Self {
        self.counter = RateLimitedCounter::new(interval);
        self
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }

    /// Flushes counted since the last summary
    pub fn unlogged_publish_count(&self) -> u64 {
        self.counter.count()
    }

    fn matches(&self, table: &TableDescriptor, event: &ChangeEvent) -> bool {
        event.kind.is_dml() && self.table_name.as_deref() == Some(table.name.as_str())
    }

    /// Buffer for this batch, created with the header on first use
    fn buffer<'a>(&self, ctx: &'a mut BatchContext) -> Result<&'a mut String> {
        if !ctx.contains(&self.buffer_key) {
            let header = self.composer.header(ctx)?;
            ctx.put(&self.buffer_key, header);
        }
        ctx.get_mut(&self.buffer_key).ok_or_else(|| {
            PipelineError::Internal(format!("buffer {:?} vanished", self.buffer_key))
        })
    }

    fn has_text(&self, ctx: &BatchContext) -> bool {
        ctx.get(&self.buffer_key).is_some_and(|buffer| !buffer.is_empty())
    }
}

#[async_trait]
impl DataFilter for AccumulatingFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn before_write(
        &self,
        ctx: &mut BatchContext,
        table: &TableDescriptor,
        event: &ChangeEvent,
    ) -> Result<bool> {
        if self.matches(table, event) {
            if let Some(element) = self.composer.element(ctx, table, event)? {
                self.buffer(ctx)?.push_str(&element);
            }
        }
        Ok(self.load_data_in_target_database)
    }

    async fn batch_complete(&self, ctx: &mut BatchContext) -> Result<()> {
        if !self.has_text(ctx) {
            return Ok(());
        }

        let footer = self.composer.footer(ctx)?;
        let Some(mut text) = ctx.remove(&self.buffer_key) else {
            return Ok(());
        };
        text.push_str(&footer);

        let bytes = text.len();
        debug!(
            filter = %self.name,
            batch_id = ctx.batch_id(),
            sink = self.publisher.name(),
            bytes,
            "Publishing text message"
        );

        if let Err(e) = self.publisher.publish(ctx, text).await {
            warn!(
                filter = %self.name,
                batch_id = ctx.batch_id(),
                error = %e,
                "Publish failed, accumulated text dropped"
            );
            self.metrics.record_publish_failure();
            return Err(e);
        }

        self.metrics.record_flush(bytes);
        self.counter.record_event(&self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterBinding, FilterRegistry};
    use crate::message::{BatchInfo, EventKind};
    use crate::publisher::MemoryPublisher;
    use std::collections::HashSet;

    /// `[H]`, `E<id>;`, `[F]`; rows with `skip = true` yield no element
    struct MarkerComposer;

    impl TextComposer for MarkerComposer {
        fn header(&self, _ctx: &BatchContext) -> Result<String> {
            Ok("[H]".to_string())
        }

        fn element(
            &self,
            _ctx: &BatchContext,
            _table: &TableDescriptor,
            event: &ChangeEvent,
        ) -> Result<Option<String>> {
            if event.value("skip") == Some(&serde_json::Value::Bool(true)) {
                return Ok(None);
            }
            let id = event.value("id").cloned().unwrap_or_default();
            Ok(Some(format!("E{};", id)))
        }

        fn footer(&self, _ctx: &BatchContext) -> Result<String> {
            Ok("[F]".to_string())
        }

        fn name(&self) -> &'static str {
            "marker"
        }
    }

    /// Empty header and footer, echoes the `id` value (empty when absent)
    struct BareComposer;

    impl TextComposer for BareComposer {
        fn header(&self, _ctx: &BatchContext) -> Result<String> {
            Ok(String::new())
        }

        fn element(
            &self,
            _ctx: &BatchContext,
            _table: &TableDescriptor,
            event: &ChangeEvent,
        ) -> Result<Option<String>> {
            Ok(Some(event.value("id").map(|v| v.to_string()).unwrap_or_default()))
        }

        fn footer(&self, _ctx: &BatchContext) -> Result<String> {
            Ok(String::new())
        }

        fn name(&self) -> &'static str {
            "bare"
        }
    }

    fn orders_filter(publisher: &Arc<MemoryPublisher>) -> AccumulatingFilter {
        AccumulatingFilter::new("orders_text", Box::new(MarkerComposer), publisher.clone())
            .for_table("ORDERS")
    }

    fn ctx(batch_id: u64) -> BatchContext {
        BatchContext::new(BatchInfo::new(batch_id, "store"))
    }

    /// Offer rows and complete the batch, returning the per-row decisions
    async fn run(
        filter: &AccumulatingFilter,
        ctx: &mut BatchContext,
        events: &[ChangeEvent],
    ) -> Vec<bool> {
        let mut decisions = Vec::new();
        for event in events {
            let table = TableDescriptor::named(&event.table);
            decisions.push(filter.before_write(ctx, &table, event).unwrap());
        }
        filter.batch_complete(ctx).await.unwrap();
        decisions
    }

    #[tokio::test]
    async fn test_mixed_tables_publish_once() {
        let publisher = MemoryPublisher::new();
        let filter = orders_filter(&publisher);

        run(
            &filter,
            &mut ctx(1),
            &[
                ChangeEvent::insert("ORDERS").with_value("id", 1),
                ChangeEvent::update("CUSTOMERS").with_value("id", 2),
                ChangeEvent::delete("ORDERS").with_value("id", 1),
            ],
        )
        .await;

        assert_eq!(publisher.texts().await, vec!["[H]E1;E1;[F]"]);
    }

    #[tokio::test]
    async fn test_no_matching_rows_never_publishes() {
        let publisher = MemoryPublisher::new();
        let filter = orders_filter(&publisher);
        let mut ctx = ctx(1);

        run(&filter, &mut ctx, &[ChangeEvent::update("CUSTOMERS").with_value("id", 2)]).await;

        assert!(publisher.is_empty().await);
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn test_elements_follow_row_order() {
        let publisher = MemoryPublisher::new();
        let filter = orders_filter(&publisher);
        let events: Vec<ChangeEvent> = (1..=5)
            .map(|id| ChangeEvent::insert("ORDERS").with_value("id", id))
            .collect();

        run(&filter, &mut ctx(1), &events).await;

        assert_eq!(publisher.texts().await, vec!["[H]E1;E2;E3;E4;E5;[F]"]);
    }

    #[tokio::test]
    async fn test_second_completion_does_not_republish() {
        let publisher = MemoryPublisher::new();
        let filter = orders_filter(&publisher);
        let mut ctx = ctx(1);

        run(&filter, &mut ctx, &[ChangeEvent::insert("ORDERS").with_value("id", 1)]).await;
        filter.batch_complete(&mut ctx).await.unwrap();

        assert_eq!(publisher.len().await, 1);
    }

    #[tokio::test]
    async fn test_ddl_never_creates_buffer() {
        let publisher = MemoryPublisher::new();
        let filter = orders_filter(&publisher);
        let mut ctx = ctx(1);

        run(
            &filter,
            &mut ctx,
            &[
                ChangeEvent::ddl("ORDERS"),
                ChangeEvent::new(EventKind::Other, "ORDERS"),
            ],
        )
        .await;
        assert!(ctx.is_empty());
        assert!(publisher.is_empty().await);

        run(
            &filter,
            &mut ctx,
            &[
                ChangeEvent::ddl("ORDERS"),
                ChangeEvent::insert("ORDERS").with_value("id", 4),
            ],
        )
        .await;
        assert_eq!(publisher.texts().await, vec!["[H]E4;[F]"]);
    }

    #[tokio::test]
    async fn test_sequential_batches_get_fresh_header() {
        let publisher = MemoryPublisher::new();
        let filter = orders_filter(&publisher);

        run(&filter, &mut ctx(1), &[ChangeEvent::insert("ORDERS").with_value("id", 1)]).await;
        run(&filter, &mut ctx(2), &[ChangeEvent::insert("ORDERS").with_value("id", 2)]).await;

        let publications = publisher.publications().await;
        assert_eq!(publications.len(), 2);
        assert_eq!(publications[0].text, "[H]E1;[F]");
        assert_eq!(publications[1].text, "[H]E2;[F]");
        assert_eq!(publications[1].batch_id, 2);
    }

    #[tokio::test]
    async fn test_pass_through_flag_does_not_stop_accumulation() {
        let publisher = MemoryPublisher::new();
        let filter = orders_filter(&publisher).load_data_in_target_database(false);

        let decisions = run(
            &filter,
            &mut ctx(1),
            &[
                ChangeEvent::insert("ORDERS").with_value("id", 1),
                ChangeEvent::update("CUSTOMERS").with_value("id", 2),
            ],
        )
        .await;

        assert_eq!(decisions, vec![false, false]);
        assert_eq!(publisher.texts().await, vec!["[H]E1;[F]"]);
    }

    #[tokio::test]
    async fn test_skipped_only_row_creates_no_buffer() {
        let publisher = MemoryPublisher::new();
        let filter = orders_filter(&publisher);
        let mut ctx = ctx(1);

        let event = ChangeEvent::insert("ORDERS")
            .with_value("id", 1)
            .with_value("skip", true);
        let table = TableDescriptor::named("ORDERS");
        filter.before_write(&mut ctx, &table, &event).unwrap();
        assert!(ctx.is_empty());

        filter.batch_complete(&mut ctx).await.unwrap();
        assert!(publisher.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_header_is_valid() {
        let publisher = MemoryPublisher::new();
        let filter = AccumulatingFilter::new("bare", Box::new(BareComposer), publisher.clone())
            .for_table("ORDERS");

        run(&filter, &mut ctx(1), &[ChangeEvent::insert("ORDERS").with_value("id", 9)]).await;

        assert_eq!(publisher.texts().await, vec!["9"]);
    }

    #[tokio::test]
    async fn test_empty_buffer_is_not_published() {
        let publisher = MemoryPublisher::new();
        let filter = AccumulatingFilter::new("bare", Box::new(BareComposer), publisher.clone())
            .for_table("ORDERS");
        let mut ctx = ctx(1);

        // Row without an id: buffer created but stays empty.
        run(&filter, &mut ctx, &[ChangeEvent::insert("ORDERS")]).await;
        assert_eq!(ctx.len(), 1);
        assert!(publisher.is_empty().await);
    }

    #[tokio::test]
    async fn test_filter_without_table_is_inert() {
        let publisher = MemoryPublisher::new();
        let filter =
            AccumulatingFilter::new("unbound", Box::new(MarkerComposer), publisher.clone());

        let decisions = run(
            &filter,
            &mut ctx(1),
            &[ChangeEvent::insert("ORDERS").with_value("id", 1)],
        )
        .await;

        assert_eq!(decisions, vec![true]);
        assert!(publisher.is_empty().await);
    }

    #[tokio::test]
    async fn test_publish_failure_drops_text_and_propagates() {
        let publisher = MemoryPublisher::new();
        let filter = orders_filter(&publisher);
        let mut ctx = ctx(1);
        let table = TableDescriptor::named("ORDERS");

        filter
            .before_write(&mut ctx, &table, &ChangeEvent::insert("ORDERS").with_value("id", 1))
            .unwrap();
        publisher.set_failing(true);

        let err = filter.batch_complete(&mut ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Publish { .. }));
        assert!(ctx.is_empty());
        assert_eq!(filter.unlogged_publish_count(), 0);

        publisher.set_failing(false);
        filter.batch_complete(&mut ctx).await.unwrap();
        assert!(publisher.is_empty().await);
    }

    #[tokio::test]
    async fn test_successful_flushes_are_counted() {
        let publisher = MemoryPublisher::new();
        let filter =
            orders_filter(&publisher).min_time_between_log_output(Duration::from_secs(3600));

        for batch_id in 1..=3 {
            run(
                &filter,
                &mut ctx(batch_id),
                &[ChangeEvent::insert("ORDERS").with_value("id", batch_id)],
            )
            .await;
        }

        assert_eq!(filter.unlogged_publish_count(), 3);
    }

    #[tokio::test]
    async fn test_shared_instance_keeps_batches_isolated() {
        let publisher = MemoryPublisher::new();
        let filter = Arc::new(orders_filter(&publisher));
        let table = TableDescriptor::named("ORDERS");
        let mut first = ctx(1);
        let mut second = ctx(2);

        // Interleave rows of two batches on one instance.
        for id in 1..=2 {
            let row = ChangeEvent::insert("ORDERS").with_value("id", id);
            filter.before_write(&mut first, &table, &row).unwrap();
            let row = ChangeEvent::insert("ORDERS").with_value("id", id * 10);
            filter.before_write(&mut second, &table, &row).unwrap();
        }
        let (a, b) = tokio::join!(
            filter.batch_complete(&mut first),
            filter.batch_complete(&mut second)
        );
        a.unwrap();
        b.unwrap();

        let texts: HashSet<String> = publisher.texts().await.into_iter().collect();
        let expected: HashSet<String> =
            ["[H]E1;E2;[F]", "[H]E10;E20;[F]"].into_iter().map(String::from).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn test_instance_bound_to_overlapping_groups_appends_once() {
        let publisher = MemoryPublisher::new();
        let shared: Arc<dyn DataFilter> = Arc::new(orders_filter(&publisher));
        let registry = FilterRegistry::builder()
            .register(FilterBinding::from_arc(shared.clone()).for_groups(["a"]))
            .register(FilterBinding::from_arc(shared).for_groups(["a", "b"]))
            .build();
        let chain = registry.chain_for("a");
        let mut ctx = BatchContext::new(BatchInfo::new(1, "a"));

        chain
            .before_write(
                &mut ctx,
                &TableDescriptor::named("ORDERS"),
                &ChangeEvent::insert("ORDERS").with_value("id", 1),
            )
            .unwrap();
        chain.batch_complete(&mut ctx).await.unwrap();

        assert_eq!(publisher.texts().await, vec!["[H]E1;[F]"]);
    }

    #[tokio::test]
    async fn test_two_instances_use_distinct_buffers() {
        let publisher = MemoryPublisher::new();
        let registry = FilterRegistry::builder()
            .register(FilterBinding::new(orders_filter(&publisher)).for_groups(["store"]))
            .register(FilterBinding::new(orders_filter(&publisher)).for_groups(["store"]))
            .build();
        let chain = registry.chain_for("store");
        let mut ctx = ctx(1);
        let event = ChangeEvent::insert("ORDERS").with_value("id", 1);

        chain
            .before_write(&mut ctx, &TableDescriptor::named("ORDERS"), &event)
            .unwrap();
        assert_eq!(ctx.len(), 2);

        chain.batch_complete(&mut ctx).await.unwrap();
        assert_eq!(publisher.texts().await, vec!["[H]E1;[F]", "[H]E1;[F]"]);
    }
}
