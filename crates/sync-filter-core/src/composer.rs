//! Text composers for the accumulating filter
//!
//! A [`TextComposer`] supplies the three pieces of an artifact: a header
//! written once when the buffer is created, one element per matching row, and
//! a footer appended at flush.

use crate::context::BatchContext;
use crate::error::{PipelineError, Result};
use crate::message::{ChangeEvent, TableDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Header/element/footer producer
pub trait TextComposer: Send + Sync {
    /// Text that opens the artifact. An empty header is valid.
    fn header(&self, ctx: &BatchContext) -> Result<String>;

    /// Text for one row, or `None` to skip the row entirely
    fn element(
        &self,
        ctx: &BatchContext,
        table: &TableDescriptor,
        event: &ChangeEvent,
    ) -> Result<Option<String>>;

    /// Text that closes the artifact
    fn footer(&self, ctx: &BatchContext) -> Result<String>;

    /// Composer name for debugging
    fn name(&self) -> &'static str;
}

/// Render a JSON value without quoting strings
fn plain(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

// ============================================================================
// Template Composer
// ============================================================================

/// Fixed header/footer around `KIND table col=value ...` lines.
///
/// `{batch_id}`, `{node_group_id}` and `{channel}` in the header or footer are
/// replaced with the batch identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateComposer {
    #[serde(default)]
    pub header: String,

    #[serde(default)]
    pub footer: String,

    /// Appended after every element
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_separator() -> String {
    "\n".to_string()
}

impl Default for TemplateComposer {
    fn default() -> Self {
        Self {
            header: String::new(),
            footer: String::new(),
            separator: default_separator(),
        }
    }
}

impl TemplateComposer {
    pub fn new(header: impl Into<String>, footer: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            footer: footer.into(),
            ..Default::default()
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    fn expand(template: &str, ctx: &BatchContext) -> String {
        let batch = ctx.batch();
        template
            .replace("{batch_id}", &batch.batch_id.to_string())
            .replace("{node_group_id}", &batch.node_group_id)
            .replace("{channel}", &batch.channel)
    }
}

impl TextComposer for TemplateComposer {
    fn header(&self, ctx: &BatchContext) -> Result<String> {
        Ok(Self::expand(&self.header, ctx))
    }

    fn element(
        &self,
        _ctx: &BatchContext,
        table: &TableDescriptor,
        event: &ChangeEvent,
    ) -> Result<Option<String>> {
        let mut line = format!("{} {}", event.kind, table.qualified_name());
        for (column, value) in &event.values {
            // Writing to a String cannot fail.
            let _ = write!(line, " {}={}", column, plain(value));
        }
        line.push_str(&self.separator);
        Ok(Some(line))
    }

    fn footer(&self, ctx: &BatchContext) -> Result<String> {
        Ok(Self::expand(&self.footer, ctx))
    }

    fn name(&self) -> &'static str {
        "template"
    }
}

// ============================================================================
// JSON Lines Composer
// ============================================================================

#[derive(Serialize)]
struct JsonRow<'a> {
    batch_id: u64,
    table: &'a str,
    kind: &'a str,
    values: &'a crate::message::RowValues,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_values: Option<&'a crate::message::RowValues>,
}

/// One JSON object per row, newline terminated, no header or footer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonLinesComposer {
    /// Rows whose values are all null are skipped
    #[serde(default)]
    pub skip_empty_rows: bool,
}

impl TextComposer for JsonLinesComposer {
    fn header(&self, _ctx: &BatchContext) -> Result<String> {
        Ok(String::new())
    }

    fn element(
        &self,
        ctx: &BatchContext,
        table: &TableDescriptor,
        event: &ChangeEvent,
    ) -> Result<Option<String>> {
        if self.skip_empty_rows && event.values.values().all(serde_json::Value::is_null) {
            return Ok(None);
        }

        let row = JsonRow {
            batch_id: ctx.batch_id(),
            table: &table.name,
            kind: event.kind.as_code(),
            values: &event.values,
            old_values: event.old_values.as_ref(),
        };
        let mut line = serde_json::to_string(&row)
            .map_err(|e| PipelineError::serialization("Failed to encode row", e))?;
        line.push('\n');
        Ok(Some(line))
    }

    fn footer(&self, _ctx: &BatchContext) -> Result<String> {
        Ok(String::new())
    }

    fn name(&self) -> &'static str {
        "json_lines"
    }
}

/// Serializable composer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComposerConfig {
    Template(TemplateComposer),
    JsonLines(JsonLinesComposer),
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self::Template(TemplateComposer::default())
    }
}

impl ComposerConfig {
    /// Convert to boxed composer
    pub fn into_composer(self) -> Box<dyn TextComposer> {
        match self {
            Self::Template(c) => Box::new(c),
            Self::JsonLines(c) => Box::new(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BatchInfo;

    fn ctx() -> BatchContext {
        BatchContext::new(BatchInfo::new(5, "store").with_channel("sale"))
    }

    #[test]
    fn test_template_expands_batch_identity() {
        let composer = TemplateComposer::new(
            "<batch id=\"{batch_id}\" group=\"{node_group_id}\">",
            "</batch>",
        );
        assert_eq!(
            composer.header(&ctx()).unwrap(),
            "<batch id=\"5\" group=\"store\">"
        );
        assert_eq!(composer.footer(&ctx()).unwrap(), "</batch>");
    }

    #[test]
    fn test_template_element_lists_values_in_order() {
        let composer = TemplateComposer::default();
        let event = ChangeEvent::update("ORDERS")
            .with_value("id", 1)
            .with_value("status", "shipped");

        let element = composer
            .element(&ctx(), &TableDescriptor::named("ORDERS"), &event)
            .unwrap();
        assert_eq!(element.as_deref(), Some("UPDATE ORDERS id=1 status=shipped\n"));
    }

    #[test]
    fn test_json_lines_element() {
        let composer = JsonLinesComposer::default();
        let event = ChangeEvent::insert("ORDERS").with_value("id", 7);

        let element = composer
            .element(&ctx(), &TableDescriptor::named("ORDERS"), &event)
            .unwrap()
            .unwrap();
        assert!(element.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(element.trim_end()).unwrap();
        assert_eq!(parsed["batch_id"], 5);
        assert_eq!(parsed["kind"], "INSERT");
        assert_eq!(parsed["values"]["id"], 7);
        assert!(parsed.get("old_values").is_none());
    }

    #[test]
    fn test_json_lines_skips_empty_rows() {
        let composer = JsonLinesComposer { skip_empty_rows: true };
        let event = ChangeEvent::delete("ORDERS").with_value("id", serde_json::Value::Null);

        let element = composer
            .element(&ctx(), &TableDescriptor::named("ORDERS"), &event)
            .unwrap();
        assert!(element.is_none());
    }
}
