//! Filter contract, registry and chain
//!
//! Every extension that wants to observe or suppress rows during a batch load
//! implements [`DataFilter`]. Filters are bound to node groups (and optionally
//! to one table) in a [`FilterRegistry`] built once at startup; the registry
//! hands out one ordered [`FilterChain`] per node group.
//!
//! ## Built-in filters
//!
//! - **TableFilter**: Include/exclude rows by table name (with `*` wildcards)
//! - **EventKindFilter**: Include/exclude rows by change kind
//! - **AccumulatingFilter**: Composes one text artifact per batch (see
//!   [`crate::accumulator`])
//!
//! ## Example
//!
//! ```rust,ignore
//! let registry = FilterRegistry::builder()
//!     .register(FilterBinding::new(TableFilter::exclude(["AUDIT_LOG"])).for_groups(["store"]))
//!     .register(FilterBinding::new(orders_publisher).for_groups(["store"]))
//!     .build();
//!
//! let chain = registry.chain_for("store");
//! ```

use crate::context::BatchContext;
use crate::error::{FilterHook, PipelineError, Result};
use crate::message::{ChangeEvent, EventKind, TableDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

/// Interception contract for row events during a batch load.
///
/// All hooks default to pass-through so implementors only override what they
/// need. A filter must not assume it is the only one consulted: later filters
/// still see a row that an earlier filter suppressed.
#[async_trait]
pub trait DataFilter: Send + Sync {
    /// Filter name for logging, errors and metrics
    fn name(&self) -> &str;

    /// Called once per row before it is written. Returning `false` tells the
    /// target writer to skip the row.
    fn before_write(
        &self,
        _ctx: &mut BatchContext,
        _table: &TableDescriptor,
        _event: &ChangeEvent,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Called once per row after it was written
    fn after_write(
        &self,
        _ctx: &mut BatchContext,
        _table: &TableDescriptor,
        _event: &ChangeEvent,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once after the last row of the batch has been offered
    async fn batch_complete(&self, _ctx: &mut BatchContext) -> Result<()> {
        Ok(())
    }

    /// Called after the target writer committed the batch
    async fn batch_committed(&self, _ctx: &mut BatchContext) -> Result<()> {
        Ok(())
    }

    /// Called after the target writer rolled the batch back
    async fn batch_rolled_back(&self, _ctx: &mut BatchContext) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Bindings
// ============================================================================

/// Registration-order identifier assigned by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterId(pub u32);

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "filter#{}", self.0)
    }
}

/// A filter together with the node groups and table it applies to
#[derive(Clone)]
pub struct FilterBinding {
    id: FilterId,
    filter: Arc<dyn DataFilter>,
    node_group_ids: HashSet<String>,
    table: Option<String>,
}

impl FilterBinding {
    /// Bind a filter to every node group and every table
    pub fn new<F: DataFilter + 'static>(filter: F) -> Self {
        Self::from_arc(Arc::new(filter))
    }

    /// Bind an already shared filter
    pub fn from_arc(filter: Arc<dyn DataFilter>) -> Self {
        Self {
            id: FilterId(0),
            filter,
            node_group_ids: HashSet::new(),
            table: None,
        }
    }

    /// Restrict to the given node groups. An empty set means all groups.
    pub fn for_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.node_group_ids = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict per-row hooks to one table
    pub fn for_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn id(&self) -> FilterId {
        self.id
    }

    pub fn filter(&self) -> &Arc<dyn DataFilter> {
        &self.filter
    }

    pub fn name(&self) -> &str {
        self.filter.name()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// Check if the binding applies to a node group
    pub fn applies_to_group(&self, node_group_id: &str) -> bool {
        self.node_group_ids.is_empty() || self.node_group_ids.contains(node_group_id)
    }

    /// Check if per-row hooks apply to a table
    pub fn applies_to_table(&self, table: &str) -> bool {
        self.table.as_deref().map_or(true, |t| t == table)
    }

    fn abort(&self, ctx: &BatchContext, hook: FilterHook, err: PipelineError) -> PipelineError {
        warn!(
            batch_id = ctx.batch_id(),
            filter = self.name(),
            filter_id = %self.id,
            hook = %hook,
            error = %err,
            "Filter failed, aborting remaining filters"
        );
        PipelineError::filter_aborted(ctx.batch_id(), self.name(), hook, err)
    }
}

impl fmt::Debug for FilterBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterBinding")
            .field("id", &self.id)
            .field("filter", &self.filter.name())
            .field("node_group_ids", &self.node_group_ids)
            .field("table", &self.table)
            .finish()
    }
}

// ============================================================================
// Filter Chain
// ============================================================================

/// Ordered filters that apply to one node group
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    bindings: Vec<Arc<FilterBinding>>,
}

impl FilterChain {
    /// Create empty filter chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a row to every applicable filter in order.
    ///
    /// The result is the AND of all answers; every applicable filter runs even
    /// after one has suppressed the row. The first hook error aborts the chain.
    pub fn before_write(
        &self,
        ctx: &mut BatchContext,
        table: &TableDescriptor,
        event: &ChangeEvent,
    ) -> Result<bool> {
        let mut proceed = true;
        for binding in self.row_bindings(&table.name) {
            let allowed = binding
                .filter
                .before_write(ctx, table, event)
                .map_err(|e| binding.abort(ctx, FilterHook::BeforeWrite, e))?;
            if !allowed {
                trace!(
                    batch_id = ctx.batch_id(),
                    filter = binding.name(),
                    table = %event.table,
                    kind = %event.kind,
                    "Row suppressed"
                );
                proceed = false;
            }
        }
        Ok(proceed)
    }

    /// Notify applicable filters that a row was written
    pub fn after_write(
        &self,
        ctx: &mut BatchContext,
        table: &TableDescriptor,
        event: &ChangeEvent,
    ) -> Result<()> {
        for binding in self.row_bindings(&table.name) {
            binding
                .filter
                .after_write(ctx, table, event)
                .map_err(|e| binding.abort(ctx, FilterHook::AfterWrite, e))?;
        }
        Ok(())
    }

    /// Signal batch completion to every filter, regardless of table scope
    pub async fn batch_complete(&self, ctx: &mut BatchContext) -> Result<()> {
        for binding in &self.bindings {
            binding
                .filter
                .batch_complete(ctx)
                .await
                .map_err(|e| binding.abort(ctx, FilterHook::BatchComplete, e))?;
        }
        Ok(())
    }

    /// Signal a successful commit to every filter
    pub async fn batch_committed(&self, ctx: &mut BatchContext) -> Result<()> {
        for binding in &self.bindings {
            binding
                .filter
                .batch_committed(ctx)
                .await
                .map_err(|e| binding.abort(ctx, FilterHook::BatchCommitted, e))?;
        }
        Ok(())
    }

    /// Signal a rollback to every filter. Failures are logged and skipped so
    /// the original batch error stays the one reported.
    pub async fn batch_rolled_back(&self, ctx: &mut BatchContext) {
        for binding in &self.bindings {
            if let Err(e) = binding.filter.batch_rolled_back(ctx).await {
                warn!(
                    batch_id = ctx.batch_id(),
                    filter = binding.name(),
                    error = %e,
                    "Rollback notification failed"
                );
            }
        }
    }

    fn row_bindings<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Arc<FilterBinding>> {
        self.bindings
            .iter()
            .filter(move |binding| binding.applies_to_table(table))
    }

    /// Filter names in invocation order
    pub fn names(&self) -> Vec<&str> {
        self.bindings.iter().map(|b| b.name()).collect()
    }

    /// Get number of filters
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

// ============================================================================
// Filter Registry
// ============================================================================

/// Immutable node-group → filter chain table
#[derive(Debug, Default)]
pub struct FilterRegistry {
    chains: HashMap<String, FilterChain>,
    fallback: FilterChain,
    bindings: Vec<Arc<FilterBinding>>,
}

impl FilterRegistry {
    pub fn builder() -> FilterRegistryBuilder {
        FilterRegistryBuilder::default()
    }

    /// Ordered chain for a node group. Groups never named in any binding get
    /// the filters bound to all groups.
    pub fn chain_for(&self, node_group_id: &str) -> &FilterChain {
        self.chains.get(node_group_id).unwrap_or(&self.fallback)
    }

    /// All bindings in registration order
    pub fn bindings(&self) -> &[Arc<FilterBinding>] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Collects bindings and assigns ids in registration order
#[derive(Default)]
pub struct FilterRegistryBuilder {
    bindings: Vec<FilterBinding>,
}

impl FilterRegistryBuilder {
    /// Add binding (builder pattern)
    pub fn register(mut self, binding: FilterBinding) -> Self {
        self.add(binding);
        self
    }

    /// Add binding
    pub fn add(&mut self, mut binding: FilterBinding) -> FilterId {
        let id = FilterId(self.bindings.len() as u32);
        binding.id = id;
        self.bindings.push(binding);
        id
    }

    pub fn build(self) -> FilterRegistry {
        let bindings: Vec<Arc<FilterBinding>> = self.bindings.into_iter().map(Arc::new).collect();

        let groups: HashSet<&String> = bindings
            .iter()
            .flat_map(|b| b.node_group_ids.iter())
            .collect();

        let chains = groups
            .into_iter()
            .map(|group| {
                let chain = chain_of(group, bindings.iter().filter(|b| b.applies_to_group(group)));
                (group.clone(), chain)
            })
            .collect();

        let fallback = chain_of("*", bindings.iter().filter(|b| b.node_group_ids.is_empty()));

        FilterRegistry {
            chains,
            fallback,
            bindings,
        }
    }
}

/// Ordered chain in which every filter instance appears once. A second binding
/// of an instance already in the chain is skipped, so the instance keeps a
/// single buffer key per batch.
fn chain_of<'a>(
    group: &str,
    candidates: impl Iterator<Item = &'a Arc<FilterBinding>>,
) -> FilterChain {
    let mut bindings: Vec<Arc<FilterBinding>> = Vec::new();
    for binding in candidates {
        if bindings.iter().any(|b| same_instance(b, binding)) {
            warn!(
                node_group = group,
                filter = binding.name(),
                filter_id = %binding.id,
                "Filter instance bound twice for node group, ignoring later binding"
            );
            continue;
        }
        bindings.push(binding.clone());
    }
    FilterChain { bindings }
}

fn same_instance(a: &FilterBinding, b: &FilterBinding) -> bool {
    std::ptr::eq(
        Arc::as_ptr(&a.filter) as *const (),
        Arc::as_ptr(&b.filter) as *const (),
    )
}

// ============================================================================
// Table Filter
// ============================================================================

/// Suppress rows by table name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableFilter {
    /// Tables or `*` patterns to include (if non-empty, only these pass)
    #[serde(default)]
    include: Vec<String>,

    /// Tables or `*` patterns that are always suppressed
    #[serde(default)]
    exclude: Vec<String>,
}

impl TableFilter {
    /// Create include-only filter
    pub fn include(tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            include: tables.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }

    /// Create exclude-only filter
    pub fn exclude(tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            include: Vec::new(),
            exclude: tables.into_iter().map(Into::into).collect(),
        }
    }

    /// Add exclude pattern
    pub fn with_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    /// Check if a table matches a pattern, ignoring ASCII case. Each `*`
    /// matches any run of characters, including none.
    fn matches_pattern(table: &str, pattern: &str) -> bool {
        if !pattern.contains('*') {
            return pattern.eq_ignore_ascii_case(table);
        }
        let table = table.to_ascii_uppercase();
        let pattern = pattern.to_ascii_uppercase();
        let mut parts: Vec<&str> = pattern.split('*').collect();
        // At least two parts because the pattern contains a `*`.
        let last = parts.pop().unwrap_or_default();
        let first = parts.remove(0);

        let Some(mut rest) = table.strip_prefix(first) else {
            return false;
        };
        for part in parts {
            match rest.find(part) {
                Some(at) => rest = &rest[at + part.len()..],
                None => return false,
            }
        }
        rest.ends_with(last)
    }

    fn passes(&self, table: &str) -> bool {
        if self.exclude.iter().any(|p| Self::matches_pattern(table, p)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| Self::matches_pattern(table, p))
    }
}

impl DataFilter for TableFilter {
    fn name(&self) -> &str {
        "table_filter"
    }

    fn before_write(
        &self,
        _ctx: &mut BatchContext,
        table: &TableDescriptor,
        _event: &ChangeEvent,
    ) -> Result<bool> {
        Ok(self.passes(&table.name))
    }
}

// ============================================================================
// Event Kind Filter
// ============================================================================

/// Suppress rows by change kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventKindFilter {
    /// Kinds to include (if non-empty, only these pass)
    #[serde(default)]
    include: HashSet<EventKind>,

    /// Kinds to exclude
    #[serde(default)]
    exclude: HashSet<EventKind>,
}

impl EventKindFilter {
    /// Create filter that includes only specified kinds
    pub fn include(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            include: kinds.into_iter().collect(),
            exclude: HashSet::new(),
        }
    }

    /// Create filter that excludes specified kinds
    pub fn exclude(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            include: HashSet::new(),
            exclude: kinds.into_iter().collect(),
        }
    }

    /// Create filter for data rows only (no schema changes)
    pub fn dml_only() -> Self {
        Self::include([EventKind::Insert, EventKind::Update, EventKind::Delete])
    }
}

impl DataFilter for EventKindFilter {
    fn name(&self) -> &str {
        "event_kind_filter"
    }

    fn before_write(
        &self,
        _ctx: &mut BatchContext,
        _table: &TableDescriptor,
        event: &ChangeEvent,
    ) -> Result<bool> {
        if self.exclude.contains(&event.kind) {
            return Ok(false);
        }
        Ok(self.include.is_empty() || self.include.contains(&event.kind))
    }
}
