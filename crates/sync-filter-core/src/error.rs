//! Error types for the sync filter pipeline
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.

use std::fmt;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Boxed error source carried by pipeline errors
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Filter hook that was running when a failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHook {
    BeforeWrite,
    AfterWrite,
    BatchComplete,
    BatchCommitted,
    BatchRolledBack,
}

impl fmt::Display for FilterHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeforeWrite => "before_write",
            Self::AfterWrite => "after_write",
            Self::BatchComplete => "batch_complete",
            Self::BatchCommitted => "batch_committed",
            Self::BatchRolledBack => "batch_rolled_back",
        };
        f.write_str(name)
    }
}

/// Primary error type for all pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Publish sink failed to deliver an artifact
    #[error("Publish error in sink '{sink}': {message}")]
    Publish {
        sink: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Target writer (persistence path) failure
    #[error("Writer error: {message}")]
    Writer {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A filter hook failed; remaining filters for the batch were skipped
    #[error("Filter '{filter}' aborted batch {batch_id} in {hook}: {source}")]
    FilterAborted {
        batch_id: u64,
        filter: String,
        hook: FilterHook,
        #[source]
        source: Box<PipelineError>,
    },

    /// Text composition failure inside a filter
    #[error("Compose error: {message}")]
    Compose {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Message serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Input/output errors outside the sinks
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Retry limit exceeded; `source` is the failure of the last attempt
    #[error("Retry exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Create a publish error
    pub fn publish(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            sink: sink.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a publish error with source
    pub fn publish_with_source(
        sink: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Publish {
            sink: sink.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a writer error
    pub fn writer(message: impl Into<String>) -> Self {
        Self::Writer {
            message: message.into(),
            source: None,
        }
    }

    /// Create a compose error
    pub fn compose(message: impl Into<String>) -> Self {
        Self::Compose {
            message: message.into(),
            source: None,
        }
    }

    /// Create a serialization error with source
    pub fn serialization(message: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Wrap a hook failure with the batch and filter that produced it
    pub fn filter_aborted(
        batch_id: u64,
        filter: impl Into<String>,
        hook: FilterHook,
        source: PipelineError,
    ) -> Self {
        Self::FilterAborted {
            batch_id,
            filter: filter.into(),
            hook,
            source: Box::new(source),
        }
    }

    /// Wrap the last failure of a batch that ran out of attempts
    pub fn retry_exhausted(attempts: u32, source: PipelineError) -> Self {
        Self::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    /// Check if the whole batch may succeed when replayed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Publish { .. } | Self::Writer { .. } | Self::Io { .. } => true,
            Self::FilterAborted { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Innermost error, unwrapping filter abort and retry layers
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            Self::FilterAborted { source, .. } | Self::RetryExhausted { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub batch_id: Option<u64>,
    pub node_group_id: Option<String>,
    pub table: Option<String>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            batch_id: None,
            node_group_id: None,
            table: None,
        }
    }

    pub fn with_batch(mut self, batch_id: u64, node_group_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id);
        self.node_group_id = Some(node_group_id.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(id) = self.batch_id {
            write!(f, " batch={}", id)?;
        }
        if let Some(ref group) = self.node_group_id {
            write!(f, " node_group={}", group)?;
        }
        if let Some(ref table) = self.table {
            write!(f, " table={}", table)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::error!(
                error = %e,
                component = ctx.component,
                operation = %ctx.operation,
                batch_id = ?ctx.batch_id,
                node_group_id = ?ctx.node_group_id,
                table = ?ctx.table,
                "Operation failed"
            );
            e
        })
    }
}
