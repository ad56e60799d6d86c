//! Message types for the sync filter pipeline
//!
//! Defines the change event, table descriptor and batch structures that flow
//! from capture through the filter chain to the target writer.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Column values of a captured row, in column order
pub type RowValues = IndexMap<String, serde_json::Value>;

/// Kind of captured change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// Schema change
    Ddl,
    /// Anything else the capture layer forwards (SQL scripts, reloads, ...)
    Other,
}

impl EventKind {
    /// Short uppercase code used in composed text
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Ddl => "DDL",
            Self::Other => "OTHER",
        }
    }

    /// Check if this is a data-modification kind
    pub fn is_dml(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_code())
    }
}

/// Row-level change captured from a source table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Source table name
    pub table: String,

    /// The change kind
    pub kind: EventKind,

    /// Row values after the change (key values only for deletes)
    #[serde(default)]
    pub values: RowValues,

    /// Row values before the change, when the capture layer provides them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_values: Option<RowValues>,
}

impl ChangeEvent {
    /// Create an event of the given kind with no values
    pub fn new(kind: EventKind, table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            kind,
            values: RowValues::new(),
            old_values: None,
        }
    }

    /// Create an insert event
    pub fn insert(table: impl Into<String>) -> Self {
        Self::new(EventKind::Insert, table)
    }

    /// Create an update event
    pub fn update(table: impl Into<String>) -> Self {
        Self::new(EventKind::Update, table)
    }

    /// Create a delete event
    pub fn delete(table: impl Into<String>) -> Self {
        Self::new(EventKind::Delete, table)
    }

    /// Create a schema change event
    pub fn ddl(table: impl Into<String>) -> Self {
        Self::new(EventKind::Ddl, table)
    }

    /// Builder: append a column value
    pub fn with_value(
        mut self,
        column: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    /// Builder: append a before-image column value
    pub fn with_old_value(
        mut self,
        column: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.old_values
            .get_or_insert_with(RowValues::new)
            .insert(column.into(), value.into());
        self
    }

    /// Get a column value
    pub fn value(&self, column: &str) -> Option<&serde_json::Value> {
        self.values.get(column)
    }
}

/// Structural description of a target table
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(default)]
    pub columns: Vec<String>,

    #[serde(default)]
    pub primary_keys: Vec<String>,
}

impl TableDescriptor {
    /// Descriptor carrying only a table name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_primary_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.primary_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Fully qualified name (`catalog.schema.table` with absent parts omitted)
    pub fn qualified_name(&self) -> String {
        [self.catalog.as_deref(), self.schema.as_deref(), Some(self.name.as_str())]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Identity of one synchronization batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub batch_id: u64,

    /// Node group of the synchronization partner
    pub node_group_id: String,

    #[serde(default)]
    pub source_node_id: String,

    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_channel() -> String {
    "default".to_string()
}

impl BatchInfo {
    pub fn new(batch_id: u64, node_group_id: impl Into<String>) -> Self {
        Self {
            batch_id,
            node_group_id: node_group_id.into(),
            source_node_id: String::new(),
            channel: default_channel(),
        }
    }

    pub fn with_source_node(mut self, node_id: impl Into<String>) -> Self {
        self.source_node_id = node_id.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

/// Ordered change events delivered and completed as a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub info: BatchInfo,

    /// Descriptors for the tables touched by this batch, by table name
    #[serde(default)]
    pub tables: IndexMap<String, TableDescriptor>,

    #[serde(default)]
    pub events: Vec<ChangeEvent>,
}

impl Batch {
    pub fn new(info: BatchInfo) -> Self {
        Self {
            info,
            tables: IndexMap::new(),
            events: Vec::new(),
        }
    }

    /// Builder: register a table descriptor
    pub fn with_table(mut self, table: TableDescriptor) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Builder: append an event
    pub fn with_event(mut self, event: ChangeEvent) -> Self {
        self.events.push(event);
        self
    }

    /// Resolve the descriptor for a table, falling back to a name-only one
    pub fn descriptor(&self, table: &str) -> Cow<'_, TableDescriptor> {
        match self.tables.get(table) {
            Some(descriptor) => Cow::Borrowed(descriptor),
            None => Cow::Owned(TableDescriptor::named(table)),
        }
    }

    /// Number of events in batch
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if batch is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Deserialize a batch from a JSON document
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
