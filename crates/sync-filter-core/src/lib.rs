//! # Sync Filter Core
//!
//! Batch-scoped filter pipeline for database synchronization.
//!
//! Row change events of a batch pass through an ordered chain of filters that
//! may observe or suppress them before the target writer persists them. At the
//! end of the batch every filter gets a completion hook, which is where the
//! accumulating filter publishes the one text artifact it composed for the
//! batch.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │   Batch     │────►│ FilterChain │────►│ TargetWriter │
//! │ (events)    │     │ before_write│     │  (external)  │
//! └─────────────┘     └──────┬──────┘     └──────────────┘
//!                            │ batch_complete
//!                     ┌──────┴───────────┐     ┌───────────┐
//!                     │AccumulatingFilter│────►│ Publisher │
//!                     │ (BatchContext)   │     └───────────┘
//!                     └──────────────────┘
//! ```

pub mod accumulator;
pub mod composer;
pub mod config;
pub mod context;
pub mod counter;
pub mod error;
pub mod filter;
pub mod message;
pub mod metrics;
pub mod publisher;
pub mod writer;

pub use accumulator::*;
pub use composer::*;
pub use self::config::*;
pub use context::*;
pub use counter::*;
pub use error::*;
pub use filter::*;
pub use message::*;
pub use self::metrics::*;
pub use publisher::*;
pub use writer::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::accumulator::AccumulatingFilter;
    pub use crate::composer::TextComposer;
    pub use crate::config::PipelineConfig;
    pub use crate::context::{BatchContext, ContextKey};
    pub use crate::error::{PipelineError, Result};
    pub use crate::filter::{DataFilter, FilterBinding, FilterChain, FilterRegistry};
    pub use crate::message::{Batch, BatchInfo, ChangeEvent, EventKind, TableDescriptor};
    pub use crate::publisher::Publisher;
    pub use crate::writer::TargetWriter;
}
