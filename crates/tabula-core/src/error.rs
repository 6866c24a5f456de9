use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TabulaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("registry error: {0}")]
    Registry(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("segment format error: {0}")]
    SegmentFormat(String),
    #[error("sql parse error: {0}")]
    SqlParse(String),
    #[error(transparent)]
    Ingestion(#[from] IngestionError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Summarization(#[from] SummarizationError),
}

pub type Result<T> = std::result::Result<T, TabulaError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ingestion failed ({}): {detail}", .reason.code())]
pub struct IngestionError {
    pub reason: IngestionReason,
    pub detail: String,
}

impl IngestionError {
    pub fn new(reason: IngestionReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    /// Transient errors are retried by queue redelivery; the rest are terminal.
    pub fn is_transient(&self) -> bool {
        self.reason == IngestionReason::IoTransient
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestionReason {
    Unparsable,
    Empty,
    Oversized,
    IoTransient,
}

impl IngestionReason {
    pub fn code(&self) -> &'static str {
        match self {
            IngestionReason::Unparsable => "unparsable",
            IngestionReason::Empty => "empty",
            IngestionReason::Oversized => "oversized",
            IngestionReason::IoTransient => "io-transient",
        }
    }
}

impl fmt::Display for IngestionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sql rejected ({}): {detail}", .reason.code())]
pub struct ValidationError {
    pub reason: ValidationReason,
    pub detail: String,
}

impl ValidationError {
    pub fn new(reason: ValidationReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationReason {
    NotASelect,
    MultipleStatements,
    UnknownColumn,
    DisallowedFunction,
    MissingLimit,
}

impl ValidationReason {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationReason::NotASelect => "not-a-select",
            ValidationReason::MultipleStatements => "multiple-statements",
            ValidationReason::UnknownColumn => "unknown-column",
            ValidationReason::DisallowedFunction => "disallowed-function",
            ValidationReason::MissingLimit => "missing-limit",
        }
    }
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution failed ({}): {detail}", .reason.code())]
pub struct ExecutionError {
    pub reason: ExecutionReason,
    pub detail: String,
}

impl ExecutionError {
    pub fn new(reason: ExecutionReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionReason {
    Timeout,
    ResourceExceeded,
    EngineFault,
}

impl ExecutionReason {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionReason::Timeout => "timeout",
            ExecutionReason::ResourceExceeded => "resource-exceeded",
            ExecutionReason::EngineFault => "engine-fault",
        }
    }
}

impl fmt::Display for ExecutionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("generation failed ({}): {detail}", .reason.code())]
pub struct GenerationError {
    pub reason: GenerationReason,
    pub detail: String,
}

impl GenerationError {
    pub fn new(reason: GenerationReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationReason {
    Timeout,
    Malformed,
    Refused,
}

impl GenerationReason {
    pub fn code(&self) -> &'static str {
        match self {
            GenerationReason::Timeout => "timeout",
            GenerationReason::Malformed => "malformed",
            GenerationReason::Refused => "refused",
        }
    }
}

impl fmt::Display for GenerationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("summarization failed ({}): {detail}", .reason.code())]
pub struct SummarizationError {
    pub reason: SummarizationReason,
    pub detail: String,
}

impl SummarizationError {
    pub fn new(reason: SummarizationReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SummarizationReason {
    Timeout,
    Malformed,
}

impl SummarizationReason {
    pub fn code(&self) -> &'static str {
        match self {
            SummarizationReason::Timeout => "timeout",
            SummarizationReason::Malformed => "malformed",
        }
    }
}

impl fmt::Display for SummarizationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
