//! Publish sinks for finished artifacts
//!
//! Implementations:
//! - `LogPublisher`: Emits the artifact through `tracing`
//! - `FilePublisher`: Appends the artifact to a file
//! - `MemoryPublisher`: Keeps artifacts in memory (for testing and embedding)

use crate::context::BatchContext;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Destination for a composed artifact.
///
/// Called at most once per filter per batch. May block; the pipeline applies
/// no timeout of its own.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Deliver the artifact for the batch described by `ctx`
    async fn publish(&self, ctx: &BatchContext, text: String) -> Result<()>;

    /// Sink name for logging and errors
    fn name(&self) -> &'static str;
}

// ============================================================================
// Log Publisher
// ============================================================================

/// Writes artifacts to the log at info level
#[derive(Debug, Clone, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, ctx: &BatchContext, text: String) -> Result<()> {
        info!(
            batch_id = ctx.batch_id(),
            node_group = %ctx.node_group_id(),
            bytes = text.len(),
            message = %text,
            "Published text message"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

// ============================================================================
// File Publisher
// ============================================================================

/// Appends each artifact to a file, creating parent directories on demand
pub struct FilePublisher {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FilePublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl Publisher for FilePublisher {
    async fn publish(&self, ctx: &BatchContext, text: String) -> Result<()> {
        let _guard = self.lock.lock().await;

        let sink = self.name();

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::publish_with_source(sink, "Failed to create output directory", e)
            })?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PipelineError::publish_with_source(sink, "Failed to open file", e))?;

        file.write_all(text.as_bytes())
            .await
            .map_err(|e| PipelineError::publish_with_source(sink, "Failed to write artifact", e))?;
        file.flush()
            .await
            .map_err(|e| PipelineError::publish_with_source(sink, "Failed to flush artifact", e))?;

        debug!(
            batch_id = ctx.batch_id(),
            path = ?self.path,
            bytes = text.len(),
            "Appended text message"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

// ============================================================================
// Memory Publisher
// ============================================================================

/// Artifact captured by [`MemoryPublisher`]
#[derive(Debug, Clone)]
pub struct Publication {
    pub batch_id: u64,
    pub node_group_id: String,
    pub text: String,
    pub published_at: DateTime<Utc>,
}

/// Collects artifacts in memory. Can be switched into a failing mode.
#[derive(Default)]
pub struct MemoryPublisher {
    publications: RwLock<Vec<Publication>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent publishes fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn publications(&self) -> Vec<Publication> {
        self.publications.read().await.clone()
    }

    pub async fn texts(&self) -> Vec<String> {
        self.publications
            .read()
            .await
            .iter()
            .map(|p| p.text.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.publications.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.publications.read().await.is_empty()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, ctx: &BatchContext, text: String) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PipelineError::publish(self.name(), "publisher is failing"));
        }

        self.publications.write().await.push(Publication {
            batch_id: ctx.batch_id(),
            node_group_id: ctx.node_group_id().to_string(),
            text,
            published_at: Utc::now(),
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Serializable sink configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublisherConfig {
    #[default]
    Log,
    File {
        path: PathBuf,
    },
}

impl PublisherConfig {
    /// Convert to shared publisher
    pub fn into_publisher(self) -> Arc<dyn Publisher> {
        match self {
            Self::Log => Arc::new(LogPublisher),
            Self::File { path } => Arc::new(FilePublisher::new(path)),
        }
    }
}
