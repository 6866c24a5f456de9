use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{info, warn};

use crate::ai::generator::{fallback_sql, HeuristicModel, SqlGenerator};
use crate::ai::summarizer::Summarizer;
use crate::ai::TextModel;
use crate::config::Config;
use crate::error::{Result, TabulaError};
use crate::ingest::queue::JobQueue;
use crate::ingest::worker::WorkerPool;
use crate::ingest::JobTicket;
use crate::registry::{
    DatasetRecord, QueryRecord, QueryStatus, Registry, VersionRecord, VersionStatus,
};
use crate::sql::{execute, validate_sql, ExecLimits, ResourceLimits};
use crate::store::{Schema, TenantStore, Value};
use crate::util::ids::{short_id, validate_identifier};
use crate::util::time::unix_millis;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub dataset_id: String,
    pub version: u64,
    pub job_id: String,
}

#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: u64,
    pub status: VersionStatus,
    pub attempts: u32,
    pub row_count: Option<u64>,
    pub schema: Option<Schema>,
    pub reason: Option<String>,
    pub created_at_ms: u64,
}

impl From<VersionRecord> for VersionInfo {
    fn from(rec: VersionRecord) -> Self {
        Self {
            version: rec.version,
            status: rec.status,
            attempts: rec.attempts,
            row_count: rec.row_count,
            schema: rec.schema,
            reason: rec.reason,
            created_at_ms: rec.created_at_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub total_rows: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub query_id: String,
    pub dataset_id: String,
    pub version_used: u64,
    pub question: String,
    pub generated_sql: String,
    pub answer: String,
    pub raw_answer: String,
    pub preview: Preview,
    pub row_count: u64,
}

/// Top-level handle: durable registry, per-tenant segment store, ingestion
/// worker pool, and the question-to-answer query pipeline.
pub struct Tabula {
    root: PathBuf,
    config: Config,
    registry: Arc<Registry>,
    store: Arc<TenantStore>,
    jobs_tx: Sender<JobTicket>,
    pool: WorkerPool,
    generator: SqlGenerator,
    summarizer: Summarizer,
}

impl Tabula {
    pub fn open(root: impl AsRef<Path>, config: Config) -> Result<Self> {
        let model = default_model(&config)?;
        // Without a configured model the summarizer stays in its
        // deterministic mode.
        let summarizer_model = if config.llm_model_path.is_some() {
            Some(Arc::clone(&model))
        } else {
            None
        };
        Self::open_with_models(root, config, model, summarizer_model)
    }

    /// Open with an explicit model backend, used by tests to script the
    /// generator's output.
    pub fn open_with_model(
        root: impl AsRef<Path>,
        config: Config,
        model: Arc<dyn TextModel>,
    ) -> Result<Self> {
        Self::open_with_models(root, config, model, None)
    }

    fn open_with_models(
        root: impl AsRef<Path>,
        config: Config,
        generator_model: Arc<dyn TextModel>,
        summarizer_model: Option<Arc<dyn TextModel>>,
    ) -> Result<Self> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let registry = Arc::new(Registry::load_or_create(&root)?);
        let store = Arc::new(TenantStore::new(&root));
        let queue = JobQueue::new();
        let jobs_tx = queue.sender();

        // at-least-once: anything non-terminal goes back on the queue
        let recovered = registry.recoverable_jobs();
        if !recovered.is_empty() {
            info!(count = recovered.len(), "re-enqueueing interrupted ingestion jobs");
        }
        for ticket in recovered {
            queue.enqueue(ticket)?;
        }

        let pool = WorkerPool::spawn(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            queue.receiver(),
            queue.sender(),
        )?;

        let generator = SqlGenerator::new(generator_model, config.generation_timeout);
        let summarizer = Summarizer::new(
            summarizer_model,
            config.summarization_timeout,
            config.answer_max_chars,
        );

        Ok(Self {
            root,
            config,
            registry,
            store,
            jobs_tx,
            pool,
            generator,
            summarizer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Accept a CSV payload, spool it, and enqueue the ingestion job. The
    /// version number is assigned here; parsing happens on a worker.
    pub fn submit_ingestion(
        &self,
        tenant: &str,
        dataset_id: Option<&str>,
        payload: &[u8],
    ) -> Result<IngestReceipt> {
        validate_identifier("tenant", tenant)?;
        if let Some(id) = dataset_id {
            validate_identifier("dataset", id)?;
        }

        let dataset_id = self.registry.create_or_get_dataset(tenant, dataset_id)?;
        let job_id = short_id("job");

        let spool_dir = self.root.join("uploads").join(tenant);
        std::fs::create_dir_all(&spool_dir)?;
        let source_ref = spool_dir.join(format!("{dataset_id}-{job_id}.csv"));
        std::fs::write(&source_ref, payload)?;

        let version = self
            .registry
            .begin_version(tenant, &dataset_id, &job_id, &source_ref)?;

        let ticket = JobTicket {
            tenant: tenant.to_string(),
            dataset_id: dataset_id.clone(),
            version,
            job_id: job_id.clone(),
            source_ref,
        };
        self.jobs_tx
            .send(ticket)
            .map_err(|_| TabulaError::ChannelClosed)?;

        info!(tenant, dataset = %dataset_id, version, job_id = %job_id, "ingestion submitted");
        Ok(IngestReceipt {
            dataset_id,
            version,
            job_id,
        })
    }

    pub fn ingestion_status(
        &self,
        tenant: &str,
        dataset: &str,
        version: u64,
    ) -> Result<VersionInfo> {
        Ok(self.registry.get_version(tenant, dataset, version)?.into())
    }

    /// Poll until the version reaches Ready or Failed.
    pub fn wait_for_terminal(
        &self,
        tenant: &str,
        dataset: &str,
        version: u64,
        timeout: Duration,
    ) -> Result<VersionInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            let info = self.ingestion_status(tenant, dataset, version)?;
            if info.status.is_terminal() {
                return Ok(info);
            }
            if Instant::now() >= deadline {
                return Err(TabulaError::Registry(format!(
                    "{dataset} v{version} still {:?} after {timeout:?}",
                    info.status
                )));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn list_datasets(&self, tenant: &str) -> Vec<DatasetRecord> {
        self.registry.list_datasets(tenant)
    }

    pub fn query_history(&self, tenant: &str, dataset: &str) -> Vec<QueryRecord> {
        self.registry.query_history(tenant, dataset)
    }

    /// Answer a natural-language question against one dataset version. Every
    /// outcome, including rejected SQL, lands in the query log.
    pub fn submit_query(
        &self,
        tenant: &str,
        dataset: &str,
        version: Option<u64>,
        question: &str,
    ) -> Result<QueryResponse> {
        validate_identifier("tenant", tenant)?;
        validate_identifier("dataset", dataset)?;
        let started = Instant::now();
        let query_deadline = started + self.config.query_deadline;

        // Version pinning: an explicit version must exist and be Ready; the
        // default is the dataset's current version.
        let version_rec = match version {
            Some(v) => {
                let rec = self.registry.get_version(tenant, dataset, v)?;
                if rec.status != VersionStatus::Ready {
                    return Err(TabulaError::Registry(format!(
                        "{dataset} v{v} is {:?}, not Ready",
                        rec.status
                    )));
                }
                rec
            }
            None => self
                .registry
                .get_current_version(tenant, dataset)?
                .ok_or_else(|| {
                    TabulaError::NotFound(format!("{dataset} has no ready version"))
                })?,
        };
        let version_used = version_rec.version;

        let reader = self.store.open_version_segment(tenant, dataset, version_used)?;
        let schema = reader.schema.clone();
        let rows = reader.read_rows(None)?;
        let samples: Vec<Vec<Value>> = rows
            .iter()
            .take(self.config.prompt_sample_rows)
            .cloned()
            .collect();

        let query_id = short_id("qry");
        // each stage's timeout is further capped by whatever is left of the
        // overall query deadline
        let generated_sql = match self.generator.generate_sql(
            question,
            dataset,
            &schema,
            &samples,
            self.config.max_result_rows,
            query_deadline,
        ) {
            Ok(sql) => sql,
            Err(err) => {
                warn!(query_id = %query_id, error = %err, "generation failed, using fallback");
                fallback_sql(dataset)
            }
        };

        let limits = ResourceLimits {
            max_rows: self.config.max_result_rows,
            require_explicit_limit: self.config.require_explicit_limit,
        };
        let validated = match validate_sql(&generated_sql, dataset, &schema, &limits) {
            Ok(v) => v,
            Err(err) => {
                self.log_failed_query(
                    &query_id,
                    tenant,
                    dataset,
                    version_used,
                    question,
                    &generated_sql,
                    &err.to_string(),
                )?;
                return Err(err.into());
            }
        };

        let exec_deadline =
            (Instant::now() + self.config.execution_timeout).min(query_deadline);
        let exec_limits = ExecLimits {
            max_rows: self.config.max_result_rows,
            deadline: exec_deadline,
        };
        let output = match execute(&validated.statement, &schema, &rows, &exec_limits) {
            Ok(out) => out,
            Err(err) => {
                self.log_failed_query(
                    &query_id,
                    tenant,
                    dataset,
                    version_used,
                    question,
                    &generated_sql,
                    &err.to_string(),
                )?;
                return Err(err.into());
            }
        };

        let raw_answer = self.summarizer.raw_answer(&output);
        let answer = match self
            .summarizer
            .summarize(question, &schema, &output, query_deadline)
        {
            Ok(a) => a,
            Err(err) => {
                warn!(query_id = %query_id, error = %err, "summarization failed, using raw answer");
                raw_answer.clone()
            }
        };

        let preview_take = self.config.preview_rows.min(output.rows.len());
        let preview = Preview {
            columns: output.columns.clone(),
            rows: output.rows[..preview_take].to_vec(),
            total_rows: output.total_rows,
            truncated: output.total_rows > preview_take as u64,
        };
        let row_count = output.rows.len() as u64;

        self.registry.record_query(QueryRecord {
            query_id: query_id.clone(),
            tenant: tenant.to_string(),
            dataset_id: dataset.to_string(),
            version_used,
            question: question.to_string(),
            generated_sql: Some(generated_sql.clone()),
            validation: None,
            row_count: Some(row_count),
            answer: Some(answer.clone()),
            raw_answer: Some(raw_answer.clone()),
            status: QueryStatus::Answered,
            created_at_ms: unix_millis(),
        })?;

        Ok(QueryResponse {
            query_id,
            dataset_id: dataset.to_string(),
            version_used,
            question: question.to_string(),
            generated_sql,
            answer,
            raw_answer,
            preview,
            row_count,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn log_failed_query(
        &self,
        query_id: &str,
        tenant: &str,
        dataset: &str,
        version_used: u64,
        question: &str,
        generated_sql: &str,
        detail: &str,
    ) -> Result<()> {
        self.registry.record_query(QueryRecord {
            query_id: query_id.to_string(),
            tenant: tenant.to_string(),
            dataset_id: dataset.to_string(),
            version_used,
            question: question.to_string(),
            generated_sql: Some(generated_sql.to_string()),
            validation: Some(detail.to_string()),
            row_count: None,
            answer: None,
            raw_answer: None,
            status: QueryStatus::Failed,
            created_at_ms: unix_millis(),
        })
    }

    /// Delete spooled upload files older than `max_age` that no in-flight
    /// job still references. Returns how many files were removed.
    pub fn cleanup_stale_uploads(&self, max_age: Duration) -> Result<usize> {
        let uploads = self.root.join("uploads");
        if !uploads.exists() {
            return Ok(0);
        }
        let in_flight: Vec<PathBuf> = self
            .registry
            .recoverable_jobs()
            .into_iter()
            .map(|t| t.source_ref)
            .collect();

        let mut removed = 0;
        for tenant_dir in std::fs::read_dir(&uploads)? {
            let tenant_dir = tenant_dir?;
            if !tenant_dir.file_type()?.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(tenant_dir.path())? {
                let entry = entry?;
                let path = entry.path();
                if in_flight.contains(&path) {
                    continue;
                }
                let modified = entry.metadata()?.modified()?;
                let age = modified.elapsed().unwrap_or(Duration::ZERO);
                if age >= max_age {
                    std::fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up stale upload files");
        }
        Ok(removed)
    }

    pub fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}

impl Drop for Tabula {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn default_model(config: &Config) -> Result<Arc<dyn TextModel>> {
    match &config.llm_model_path {
        None => Ok(Arc::new(HeuristicModel)),
        #[cfg(feature = "llm")]
        Some(path) => Ok(Arc::new(crate::ai::llama::LlamaTextModel::new(path.clone()))),
        #[cfg(not(feature = "llm"))]
        Some(_) => Err(TabulaError::Config(
            "llm_model_path set but the `llm` feature is disabled".to_string(),
        )),
    }
}
