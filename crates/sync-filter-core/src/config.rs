//! Configuration types for the sync filter pipeline
//!
//! Uses the `config` crate for layered configuration from files and environment.

use crate::accumulator::AccumulatingFilter;
use crate::composer::ComposerConfig;
use crate::error::{PipelineError, Result};
use crate::filter::{EventKindFilter, FilterBinding, FilterRegistry, TableFilter};
use crate::publisher::{Publisher, PublisherConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Root configuration for the pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Filters in registration order
    #[serde(default)]
    pub filters: Vec<FilterConfig>,

    /// Batch processor configuration
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================================================
// Filter Configuration
// ============================================================================

/// Serializable filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    Accumulator(AccumulatorConfig),
    Table {
        #[serde(flatten)]
        binding: BindingConfig,
        #[serde(flatten)]
        filter: TableFilter,
    },
    EventKind {
        #[serde(flatten)]
        binding: BindingConfig,
        #[serde(flatten)]
        filter: EventKindFilter,
    },
}

/// Where a filter applies
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Node groups the filter applies to (empty: all)
    #[serde(default)]
    pub node_group_ids_to_apply_to: Vec<String>,

    /// Restrict per-row hooks to one table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_scope: Option<String>,
}

impl BindingConfig {
    fn bind(&self, binding: FilterBinding) -> FilterBinding {
        let binding = binding.for_groups(self.node_group_ids_to_apply_to.iter().cloned());
        match &self.table_scope {
            Some(table) => binding.for_table(table.clone()),
            None => binding,
        }
    }
}

/// Accumulating text publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumulatorConfig {
    /// Filter name used in logs and metrics
    pub name: String,

    /// Table whose rows are accumulated; a filter without one is inert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,

    #[serde(default)]
    pub node_group_ids_to_apply_to: Vec<String>,

    /// Answer returned to the writer for every row
    #[serde(default = "default_true")]
    pub load_data_in_target_database: bool,

    #[serde(default = "default_min_time_between_log_output")]
    pub min_time_in_ms_between_log_output: u64,

    #[serde(default)]
    pub composer: ComposerConfig,

    #[serde(default)]
    pub sink: PublisherConfig,
}

fn default_true() -> bool {
    true
}

fn default_min_time_between_log_output() -> u64 {
    30_000
}

impl AccumulatorConfig {
    pub fn new(name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: Some(table_name.into()),
            node_group_ids_to_apply_to: Vec::new(),
            load_data_in_target_database: true,
            min_time_in_ms_between_log_output: default_min_time_between_log_output(),
            composer: ComposerConfig::default(),
            sink: PublisherConfig::default(),
        }
    }

    /// Build the filter with the configured sink
    pub fn build(&self) -> AccumulatingFilter {
        self.build_with_publisher(self.sink.clone().into_publisher())
    }

    /// Build the filter with an explicit sink
    pub fn build_with_publisher(&self, publisher: Arc<dyn Publisher>) -> AccumulatingFilter {
        let filter = AccumulatingFilter::new(
            self.name.clone(),
            self.composer.clone().into_composer(),
            publisher,
        )
        .load_data_in_target_database(self.load_data_in_target_database)
        .min_time_between_log_output(Duration::from_millis(self.min_time_in_ms_between_log_output));

        match self.table_name.as_deref().filter(|t| !t.is_empty()) {
            Some(table) => filter.for_table(table),
            None => {
                debug!(filter = %self.name, "No table name configured, filter will never match");
                filter
            }
        }
    }
}

/// Build the node-group registry from configuration
pub fn build_registry(configs: &[FilterConfig]) -> FilterRegistry {
    let mut builder = FilterRegistry::builder();
    for config in configs {
        let binding = match config {
            FilterConfig::Accumulator(acc) => FilterBinding::new(acc.build())
                .for_groups(acc.node_group_ids_to_apply_to.iter().cloned()),
            FilterConfig::Table { binding, filter } => {
                binding.bind(FilterBinding::new(filter.clone()))
            }
            FilterConfig::EventKind { binding, filter } => {
                binding.bind(FilterBinding::new(filter.clone()))
            }
        };
        let id = builder.add(binding);
        debug!(filter_id = %id, "Registered filter");
    }
    builder.build()
}

// ============================================================================
// Processor Configuration
// ============================================================================

/// Batch processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Batches processed concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Whole-batch retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_concurrency() -> usize {
    4
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per batch (1 disables retry)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff delay
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Maximum backoff delay
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl PipelineConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Self::defaults()?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment variables with prefix SYNC_FILTER_
        builder = builder.add_source(
            config::Environment::with_prefix("SYNC_FILTER")
                .separator("__")
                .try_parsing(true),
        );

        Self::finish(builder)
    }

    /// Load configuration from a TOML document
    pub fn from_toml(toml: &str) -> Result<Self> {
        let builder = Self::defaults()?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml));
        Self::finish(builder)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| PipelineError::config(format!("Invalid defaults: {}", e)))?;
        Ok(config::Config::builder().add_source(defaults))
    }

    fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| PipelineError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the processor cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.processor.concurrency == 0 {
            return Err(PipelineError::config("processor.concurrency must be at least 1"));
        }
        if self.processor.retry.max_attempts == 0 {
            return Err(PipelineError::config("processor.retry.max_attempts must be at least 1"));
        }
        let mut names = std::collections::HashSet::new();
        for filter in &self.filters {
            if let FilterConfig::Accumulator(acc) = filter {
                if !names.insert(acc.name.as_str()) {
                    return Err(PipelineError::config(format!(
                        "duplicate accumulator name '{}'",
                        acc.name
                    )));
                }
            }
        }
        Ok(())
    }
}
