pub mod segment;

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TabulaError};
use crate::store::segment::{write_segment, SegmentReader};
use crate::util::time::format_millis;

/// Closed set of inferred column types. Ambiguous columns fall back to Text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

impl ColumnType {
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// Ordered column list, fixed per version at ingestion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<ColumnDef>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.column_index(name).map(|i| self.columns[i].column_type)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// One `- name (type)` line per column, for prompts and DESCRIBE output.
    pub fn describe(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("- {} ({})", c.name, c.column_type))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A single cell. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Timestamp(t) => Some(*t as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Total order used for ORDER BY and min/max: nulls first, then by kind.
    pub fn cmp_for_sort(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                _ => self.render().cmp(&other.render()),
            },
        }
    }

    /// Human-readable rendering used in previews, prompts, and answers.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{f:.1}")
                } else {
                    format!("{f}")
                }
            }
            Value::Boolean(b) => b.to_string(),
            Value::Timestamp(ms) => format_millis(*ms),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Per-tenant segment storage. Every path is namespaced by tenant, so one
/// tenant's store can never resolve into another's directory.
pub struct TenantStore {
    root: PathBuf,
}

impl TenantStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn segment_path(&self, tenant: &str, dataset: &str, version: u64) -> PathBuf {
        self.root
            .join("tenants")
            .join(tenant)
            .join(dataset)
            .join(format!("v{version}.seg"))
    }

    /// Write a new immutable segment. Refuses to overwrite: segments are
    /// write-once, and a version number is never reused.
    pub fn write_version_segment(
        &self,
        tenant: &str,
        dataset: &str,
        version: u64,
        schema: &Schema,
        rows: &[Vec<Value>],
    ) -> Result<PathBuf> {
        let path = self.segment_path(tenant, dataset, version);
        if path.exists() {
            return Err(TabulaError::SegmentFormat(format!(
                "segment already exists: {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_segment(&path, schema, rows)?;
        Ok(path)
    }

    pub fn open_version_segment(
        &self,
        tenant: &str,
        dataset: &str,
        version: u64,
    ) -> Result<SegmentReader> {
        let path = self.segment_path(tenant, dataset, version);
        if !path.exists() {
            return Err(TabulaError::NotFound(format!(
                "segment for {tenant}/{dataset} v{version}"
            )));
        }
        SegmentReader::open(path)
    }
}
