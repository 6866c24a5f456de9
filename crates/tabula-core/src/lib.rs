//! Tabula: multi-tenant tabular dataset ingestion, versioning, and
//! natural-language querying.
//!
//! CSV uploads become immutable, versioned segments per tenant. Questions
//! are translated to SQL by a pluggable model backend, pass through a
//! strict validator, run against the pinned version's segment, and come
//! back as a short natural-language answer plus a row preview.

pub mod ai;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod registry;
pub mod sql;
pub mod store;
pub mod util;

pub use ai::generator::HeuristicModel;
pub use ai::TextModel;
pub use config::{Config, ANSWER_MAX_CHARS};
pub use engine::{IngestReceipt, Preview, QueryResponse, Tabula, VersionInfo};
pub use error::{
    ExecutionError, ExecutionReason, GenerationError, GenerationReason, IngestionError,
    IngestionReason, Result, SummarizationError, SummarizationReason, TabulaError,
    ValidationError, ValidationReason,
};
pub use registry::{DatasetRecord, QueryRecord, QueryStatus, VersionRecord, VersionStatus};
pub use store::{ColumnDef, ColumnType, Schema, Value};
