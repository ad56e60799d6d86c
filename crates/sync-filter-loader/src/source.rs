//! Batch sources
//!
//! Capture is external; the loader reads already captured batches as
//! newline-delimited JSON, one [`Batch`] document per line.

use futures::stream::{self, Stream};
use std::path::Path;
use std::pin::Pin;
use sync_filter_core::prelude::*;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, info};

/// Type alias for boxed async streams of batches
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<Batch>> + Send>>;

/// Stream over an in-memory list of batches
pub fn from_batches(batches: Vec<Batch>) -> BatchStream {
    Box::pin(stream::iter(batches.into_iter().map(Ok)))
}

struct ReadState {
    lines: Option<Lines<BufReader<File>>>,
    line_no: usize,
}

/// Stream the batches of an NDJSON file. Blank lines are skipped; a line that
/// does not parse yields an error item and reading continues.
pub async fn open_ndjson(path: impl AsRef<Path>) -> Result<BatchStream> {
    let path = path.as_ref();
    let file = File::open(path)
        .await
        .map_err(|e| PipelineError::io(format!("Failed to open {}", path.display()), e))?;
    info!(path = %path.display(), "Reading batches");

    let state = ReadState {
        lines: Some(BufReader::new(file).lines()),
        line_no: 0,
    };

    let batches = stream::unfold(state, |mut state| async move {
        let lines = state.lines.as_mut()?;
        loop {
            state.line_no += 1;
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let item = Batch::from_json(&line).map_err(|e| {
                        let message = format!("Invalid batch on line {}", state.line_no);
                        PipelineError::serialization(message, e)
                    });
                    if let Ok(ref batch) = item {
                        debug!(batch_id = batch.info.batch_id, events = batch.len(), "Read batch");
                    }
                    return Some((item, state));
                }
                Ok(None) => return None,
                Err(e) => {
                    // Stop after a read failure; the file handle is unusable.
                    state.lines = None;
                    let message = format!("Failed to read line {}", state.line_no);
                    let err = PipelineError::io(message, e);
                    return Some((Err(err), state));
                }
            }
        }
    });

    Ok(Box::pin(batches))
}
