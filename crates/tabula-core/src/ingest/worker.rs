use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{IngestionError, IngestionReason, Result};
use crate::ingest::csv::parse_csv;
use crate::ingest::JobTicket;
use crate::registry::Registry;
use crate::store::TenantStore;

/// Fixed pool of ingestion workers. Each worker loops over the shared job
/// channel until its shutdown channel fires; `shutdown` joins every thread.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown_txs: Vec<Sender<()>>,
}

impl WorkerPool {
    pub fn spawn(
        config: Config,
        registry: Arc<Registry>,
        store: Arc<TenantStore>,
        jobs_rx: Receiver<JobTicket>,
        jobs_tx: Sender<JobTicket>,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(config.worker_count);
        let mut shutdown_txs = Vec::with_capacity(config.worker_count);

        for worker_id in 0..config.worker_count {
            let (stop_tx, stop_rx) = bounded::<()>(1);
            let config = config.clone();
            let registry = Arc::clone(&registry);
            let store = Arc::clone(&store);
            let jobs_rx = jobs_rx.clone();
            let jobs_tx = jobs_tx.clone();

            let handle = std::thread::Builder::new()
                .name(format!("tabula-ingest-{worker_id}"))
                .spawn(move || {
                    worker_loop(worker_id, &config, &registry, &store, &jobs_rx, &jobs_tx, &stop_rx)
                })?;
            handles.push(handle);
            shutdown_txs.push(stop_tx);
        }

        Ok(Self {
            handles,
            shutdown_txs,
        })
    }

    pub fn shutdown(&mut self) {
        for tx in self.shutdown_txs.drain(..) {
            let _ = tx.send(());
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    worker_id: usize,
    config: &Config,
    registry: &Registry,
    store: &TenantStore,
    jobs_rx: &Receiver<JobTicket>,
    jobs_tx: &Sender<JobTicket>,
    stop_rx: &Receiver<()>,
) {
    debug!(worker_id, "ingestion worker started");
    loop {
        select! {
            recv(stop_rx) -> _ => {
                debug!(worker_id, "ingestion worker stopping");
                return;
            }
            recv(jobs_rx) -> msg => {
                let Ok(ticket) = msg else {
                    debug!(worker_id, "job channel closed");
                    return;
                };
                if let Err(err) = process_job(config, registry, store, jobs_tx, &ticket) {
                    // Registry write failures here leave the version
                    // non-terminal; it is re-enqueued at next open.
                    error!(
                        job_id = %ticket.job_id,
                        error = %err,
                        "ingestion job aborted on registry error"
                    );
                }
            }
        }
    }
}

/// Run one ingestion attempt. Idempotent: a ticket whose version is already
/// terminal is dropped without touching storage.
fn process_job(
    config: &Config,
    registry: &Registry,
    store: &TenantStore,
    jobs_tx: &Sender<JobTicket>,
    ticket: &JobTicket,
) -> Result<()> {
    let record = registry.get_version(&ticket.tenant, &ticket.dataset_id, ticket.version)?;
    if record.status.is_terminal() {
        debug!(job_id = %ticket.job_id, "skipping redelivered job, version already terminal");
        return Ok(());
    }

    registry.mark_processing(&ticket.tenant, &ticket.dataset_id, ticket.version)?;

    match run_attempt(config, store, ticket) {
        Ok((schema, row_count)) => {
            registry.mark_ready(
                &ticket.tenant,
                &ticket.dataset_id,
                ticket.version,
                schema,
                row_count,
            )?;
            info!(
                tenant = %ticket.tenant,
                dataset = %ticket.dataset_id,
                version = ticket.version,
                rows = row_count,
                "version ready"
            );
            Ok(())
        }
        Err(err) if err.is_transient() => {
            let attempts =
                registry.bump_attempts(&ticket.tenant, &ticket.dataset_id, ticket.version)?;
            if attempts < config.max_job_attempts {
                warn!(
                    job_id = %ticket.job_id,
                    attempts,
                    error = %err,
                    "transient ingestion failure, requeueing"
                );
                if jobs_tx.send(ticket.clone()).is_err() {
                    registry.mark_failed(
                        &ticket.tenant,
                        &ticket.dataset_id,
                        ticket.version,
                        &err.to_string(),
                    )?;
                }
            } else {
                warn!(job_id = %ticket.job_id, attempts, "retry budget exhausted");
                registry.mark_failed(
                    &ticket.tenant,
                    &ticket.dataset_id,
                    ticket.version,
                    &err.to_string(),
                )?;
            }
            Ok(())
        }
        Err(err) => {
            info!(job_id = %ticket.job_id, error = %err, "ingestion failed");
            registry.mark_failed(
                &ticket.tenant,
                &ticket.dataset_id,
                ticket.version,
                &err.to_string(),
            )?;
            Ok(())
        }
    }
}

fn run_attempt(
    config: &Config,
    store: &TenantStore,
    ticket: &JobTicket,
) -> std::result::Result<(crate::store::Schema, u64), IngestionError> {
    // A crash between segment write and mark_ready leaves the segment on
    // disk; finish the job from it instead of rewriting.
    let seg_path = store.segment_path(&ticket.tenant, &ticket.dataset_id, ticket.version);
    if seg_path.exists() {
        let reader = crate::store::segment::SegmentReader::open(&seg_path).map_err(|e| {
            IngestionError::new(IngestionReason::IoTransient, e.to_string())
        })?;
        return Ok((reader.schema.clone(), reader.row_count));
    }

    let bytes = std::fs::read(&ticket.source_ref).map_err(|e| {
        IngestionError::new(
            IngestionReason::IoTransient,
            format!("reading {}: {e}", ticket.source_ref.display()),
        )
    })?;

    if bytes.len() as u64 > config.max_payload_bytes {
        return Err(IngestionError::new(
            IngestionReason::Oversized,
            format!(
                "payload is {} bytes, limit is {}",
                bytes.len(),
                config.max_payload_bytes
            ),
        ));
    }

    let table = parse_csv(&bytes, config.infer_sample_rows)?;

    if table.rows.len() as u64 > config.max_rows_per_dataset {
        return Err(IngestionError::new(
            IngestionReason::Oversized,
            format!(
                "{} rows exceeds per-dataset limit of {}",
                table.rows.len(),
                config.max_rows_per_dataset
            ),
        ));
    }

    store
        .write_version_segment(
            &ticket.tenant,
            &ticket.dataset_id,
            ticket.version,
            &table.schema,
            &table.rows,
        )
        .map_err(|e| IngestionError::new(IngestionReason::IoTransient, e.to_string()))?;

    Ok((table.schema, table.rows.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::VersionStatus;
    use std::path::Path;

    fn setup() -> (tempfile::TempDir, Arc<Registry>, Arc<TenantStore>) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::load_or_create(dir.path()).unwrap());
        let store = Arc::new(TenantStore::new(dir.path()));
        (dir, registry, store)
    }

    fn ticket_for(dir: &Path, registry: &Registry, csv: &str, version_hint: &str) -> JobTicket {
        let source = dir.join(format!("{version_hint}.csv"));
        std::fs::write(&source, csv).unwrap();
        registry.create_or_get_dataset("t1", Some("sales")).unwrap();
        let version = registry
            .begin_version("t1", "sales", &format!("job-{version_hint}"), &source)
            .unwrap();
        JobTicket {
            tenant: "t1".to_string(),
            dataset_id: "sales".to_string(),
            version,
            job_id: format!("job-{version_hint}"),
            source_ref: source,
        }
    }

    #[test]
    fn successful_job_marks_ready() {
        let config = Config::default();
        let (dir, registry, store) = setup();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let ticket = ticket_for(dir.path(), &registry, "a,b\n1,2\n3,4\n", "ok");

        process_job(&config, &registry, &store, &tx, &ticket).unwrap();

        let rec = registry.get_version("t1", "sales", ticket.version).unwrap();
        assert_eq!(rec.status, VersionStatus::Ready);
        assert_eq!(rec.row_count, Some(2));
        assert!(store.open_version_segment("t1", "sales", ticket.version).is_ok());
    }

    #[test]
    fn empty_payload_marks_failed_without_retry() {
        let config = Config::default();
        let (dir, registry, store) = setup();
        let (tx, rx) = crossbeam_channel::unbounded();
        let ticket = ticket_for(dir.path(), &registry, "a,b\n", "empty");

        process_job(&config, &registry, &store, &tx, &ticket).unwrap();

        let rec = registry.get_version("t1", "sales", ticket.version).unwrap();
        assert_eq!(rec.status, VersionStatus::Failed);
        assert!(rec.reason.as_deref().unwrap().contains("empty"));
        assert!(rx.is_empty());
    }

    #[test]
    fn missing_source_retries_then_fails() {
        let config = Config {
            max_job_attempts: 2,
            ..Config::default()
        };
        let (dir, registry, store) = setup();
        let (tx, rx) = crossbeam_channel::unbounded();

        let source = dir.path().join("gone.csv");
        registry.create_or_get_dataset("t1", Some("sales")).unwrap();
        let version = registry
            .begin_version("t1", "sales", "job-gone", &source)
            .unwrap();
        let ticket = JobTicket {
            tenant: "t1".to_string(),
            dataset_id: "sales".to_string(),
            version,
            job_id: "job-gone".to_string(),
            source_ref: source,
        };

        // first attempt requeues
        process_job(&config, &registry, &store, &tx, &ticket).unwrap();
        let redelivered = rx.try_recv().unwrap();
        assert_eq!(redelivered, ticket);
        assert_eq!(
            registry.get_version("t1", "sales", version).unwrap().status,
            VersionStatus::Processing
        );

        // second attempt exhausts the budget
        process_job(&config, &registry, &store, &tx, &redelivered).unwrap();
        let rec = registry.get_version("t1", "sales", version).unwrap();
        assert_eq!(rec.status, VersionStatus::Failed);
        assert!(rec.reason.as_deref().unwrap().contains("io-transient"));
        assert!(rx.is_empty());
    }

    #[test]
    fn oversized_payload_is_terminal() {
        let config = Config {
            max_payload_bytes: 64,
            ..Config::default()
        };
        let (dir, registry, store) = setup();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let big = format!("a,b\n{}", "1,2\n".repeat(64));
        let ticket = ticket_for(dir.path(), &registry, &big, "big");

        process_job(&config, &registry, &store, &tx, &ticket).unwrap();
        let rec = registry.get_version("t1", "sales", ticket.version).unwrap();
        assert_eq!(rec.status, VersionStatus::Failed);
        assert!(rec.reason.as_deref().unwrap().contains("oversized"));
    }

    #[test]
    fn redelivered_terminal_job_is_noop() {
        let config = Config::default();
        let (dir, registry, store) = setup();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let ticket = ticket_for(dir.path(), &registry, "a\n1\n", "dup");

        process_job(&config, &registry, &store, &tx, &ticket).unwrap();
        let before = registry.get_version("t1", "sales", ticket.version).unwrap();
        // second delivery of the same ticket
        process_job(&config, &registry, &store, &tx, &ticket).unwrap();
        let after = registry.get_version("t1", "sales", ticket.version).unwrap();
        assert_eq!(before.status, after.status);
        assert_eq!(before.row_count, after.row_count);
    }

    #[test]
    fn pool_spawns_and_shuts_down() {
        let config = Config::default();
        let (dir, registry, store) = setup();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut pool = WorkerPool::spawn(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            rx,
            tx.clone(),
        )
        .unwrap();

        let ticket = ticket_for(dir.path(), &registry, "a,b\n1,2\n", "pool");
        tx.send(ticket.clone()).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let rec = registry.get_version("t1", "sales", ticket.version).unwrap();
            if rec.status.is_terminal() {
                assert_eq!(rec.status, VersionStatus::Ready);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job did not finish");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        pool.shutdown();
    }
}
