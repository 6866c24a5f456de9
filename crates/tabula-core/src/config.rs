use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TabulaError};

/// Answers are hard-capped at this many characters, leaving headroom for
/// front-end formatting.
pub const ANSWER_MAX_CHARS: usize = 1500;

#[derive(Clone, Debug)]
pub struct Config {
    pub worker_count: usize,
    pub max_job_attempts: u32,
    pub max_payload_bytes: u64,
    pub max_rows_per_dataset: u64,
    pub infer_sample_rows: usize,
    pub max_result_rows: u64,
    pub preview_rows: usize,
    pub prompt_sample_rows: usize,
    pub require_explicit_limit: bool,
    pub generation_timeout: Duration,
    pub summarization_timeout: Duration,
    pub execution_timeout: Duration,
    pub query_deadline: Duration,
    pub answer_max_chars: usize,
    pub llm_model_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 2,
            max_job_attempts: 3,
            max_payload_bytes: 32 * 1024 * 1024,
            max_rows_per_dataset: 1_000_000,
            infer_sample_rows: 100,
            max_result_rows: 1000,
            preview_rows: 10,
            prompt_sample_rows: 5,
            require_explicit_limit: false,
            generation_timeout: Duration::from_secs(10),
            summarization_timeout: Duration::from_secs(10),
            execution_timeout: Duration::from_secs(5),
            query_deadline: Duration::from_secs(30),
            answer_max_chars: ANSWER_MAX_CHARS,
            llm_model_path: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(TabulaError::Config("worker_count must be > 0".to_string()));
        }
        if self.max_job_attempts == 0 {
            return Err(TabulaError::Config(
                "max_job_attempts must be > 0".to_string(),
            ));
        }
        if self.max_payload_bytes < 64 {
            return Err(TabulaError::Config(
                "max_payload_bytes must be >= 64".to_string(),
            ));
        }
        if self.infer_sample_rows == 0 {
            return Err(TabulaError::Config(
                "infer_sample_rows must be > 0".to_string(),
            ));
        }
        if self.max_result_rows == 0 {
            return Err(TabulaError::Config(
                "max_result_rows must be > 0".to_string(),
            ));
        }
        if self.preview_rows == 0 {
            return Err(TabulaError::Config("preview_rows must be > 0".to_string()));
        }
        if self.answer_max_chars < 16 {
            return Err(TabulaError::Config(
                "answer_max_chars must be >= 16".to_string(),
            ));
        }
        if self.query_deadline.is_zero()
            || self.generation_timeout.is_zero()
            || self.summarization_timeout.is_zero()
            || self.execution_timeout.is_zero()
        {
            return Err(TabulaError::Config(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
