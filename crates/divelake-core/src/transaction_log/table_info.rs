use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk format version written into new tables.
pub const TABLE_FORMAT_VERSION: u32 = 1;

/// Which of a dataset's two physical tables this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// Signal readings, one value per row.
    Data,
    /// Point and state events.
    Events,
}

impl TableKind {
    /// Both kinds, in creation order.
    pub const ALL: [TableKind; 2] = [TableKind::Data, TableKind::Events];

    /// Directory / catalog name of the table (`data`, `events`).
    pub fn name(self) -> &'static str {
        match self {
            TableKind::Data => "data",
            TableKind::Events => "events",
        }
    }

    /// Suffix of the logical view registered over this table.
    pub fn view_suffix(self) -> &'static str {
        match self {
            TableKind::Data => "Data",
            TableKind::Events => "Events",
        }
    }

    /// Columns used for hive-style partitioning, outermost first.
    pub fn partition_columns(self) -> &'static [&'static str] {
        match self {
            TableKind::Data => &["animal", "deployment", "class", "label"],
            TableKind::Events => &["animal", "deployment"],
        }
    }

    /// Column whose min/max are tracked per data file.
    pub fn time_column(self) -> &'static str {
        match self {
            TableKind::Data => "datetime",
            TableKind::Events => "datetime_start",
        }
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TableKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "data" => Ok(TableKind::Data),
            "events" => Ok(TableKind::Events),
            other => Err(format!("unknown table {other:?}; expected 'data' or 'events'")),
        }
    }
}

/// Table-level descriptor written by the first commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table kind, which fixes the schema and partitioning.
    pub kind: TableKind,
    /// Owning dataset.
    pub dataset: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// On-disk format version.
    pub format_version: u32,
}

impl TableInfo {
    /// Descriptor for a freshly created table.
    pub fn new(kind: TableKind, dataset: impl Into<String>) -> Self {
        Self {
            kind,
            dataset: dataset.into(),
            created_at: Utc::now(),
            format_version: TABLE_FORMAT_VERSION,
        }
    }
}
