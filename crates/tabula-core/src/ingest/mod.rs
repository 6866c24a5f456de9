pub mod csv;
pub mod queue;
pub mod worker;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Everything a worker needs to run one ingestion attempt. Tickets are
/// redelivered on crash recovery, so processing must be idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTicket {
    pub tenant: String,
    pub dataset_id: String,
    pub version: u64,
    pub job_id: String,
    pub source_ref: PathBuf,
}
