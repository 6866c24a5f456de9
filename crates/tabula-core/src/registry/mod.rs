use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TabulaError};
use crate::ingest::JobTicket;
use crate::store::Schema;
use crate::util::ids::short_id;
use crate::util::time::unix_millis;

pub const REGISTRY_FILE: &str = "REGISTRY.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl VersionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VersionStatus::Ready | VersionStatus::Failed)
    }
}

/// One version row. Job fields live on the version so the version and its
/// ingestion job are created in a single registry mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: u64,
    pub status: VersionStatus,
    pub job_id: String,
    pub source_ref: PathBuf,
    pub attempts: u32,
    pub created_at_ms: u64,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub schema: Option<Schema>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub dataset_id: String,
    pub current_version: Option<u64>,
    pub next_version: u64,
    pub versions: Vec<VersionRecord>,
}

impl DatasetRecord {
    fn version(&self, number: u64) -> Option<&VersionRecord> {
        self.versions.iter().find(|v| v.version == number)
    }

    fn version_mut(&mut self, number: u64) -> Option<&mut VersionRecord> {
        self.versions.iter_mut().find(|v| v.version == number)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantRecord {
    pub datasets: BTreeMap<String, DatasetRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    Answered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query_id: String,
    pub tenant: String,
    pub dataset_id: String,
    pub version_used: u64,
    pub question: String,
    #[serde(default)]
    pub generated_sql: Option<String>,
    #[serde(default)]
    pub validation: Option<String>,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub raw_answer: Option<String>,
    pub status: QueryStatus,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryState {
    pub version: u32,
    pub tenants: BTreeMap<String, TenantRecord>,
    #[serde(default)]
    pub queries: Vec<QueryRecord>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            version: 1,
            tenants: BTreeMap::new(),
            queries: Vec::new(),
        }
    }
}

/// Durable dataset/version/job/query metadata. A single mutex serializes
/// every state transition; each mutation is persisted atomically
/// (tmp file + rename + fsync) before the lock is released.
pub struct Registry {
    path: PathBuf,
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn load_or_create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let path = root.join(REGISTRY_FILE);

        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            RegistryState::default()
        };

        let registry = Self {
            path,
            state: Mutex::new(state),
        };
        registry.save(&registry.state.lock())?;
        Ok(registry)
    }

    fn save(&self, state: &RegistryState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a dataset, creating it if needed. A `None` id allocates a
    /// generated one.
    pub fn create_or_get_dataset(&self, tenant: &str, dataset_id: Option<&str>) -> Result<String> {
        let mut state = self.state.lock();
        let tenant_rec = state.tenants.entry(tenant.to_string()).or_default();

        let id = match dataset_id {
            Some(id) => id.to_string(),
            None => short_id("ds"),
        };
        if !tenant_rec.datasets.contains_key(&id) {
            tenant_rec.datasets.insert(
                id.clone(),
                DatasetRecord {
                    dataset_id: id.clone(),
                    current_version: None,
                    next_version: 1,
                    versions: Vec::new(),
                },
            );
            self.save(&state)?;
        }
        Ok(id)
    }

    /// Atomically allocate the next version number and create its job row.
    /// Numbers are never reused, even when the attempt later fails.
    pub fn begin_version(
        &self,
        tenant: &str,
        dataset: &str,
        job_id: &str,
        source_ref: &Path,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let ds = dataset_mut(&mut state, tenant, dataset)?;
        let version = ds.next_version;
        ds.next_version += 1;
        ds.versions.push(VersionRecord {
            version,
            status: VersionStatus::Pending,
            job_id: job_id.to_string(),
            source_ref: source_ref.to_path_buf(),
            attempts: 0,
            created_at_ms: unix_millis(),
            row_count: None,
            schema: None,
            reason: None,
        });
        self.save(&state)?;
        Ok(version)
    }

    pub fn mark_processing(&self, tenant: &str, dataset: &str, version: u64) -> Result<()> {
        let mut state = self.state.lock();
        let rec = version_mut(&mut state, tenant, dataset, version)?;
        match rec.status {
            VersionStatus::Pending | VersionStatus::Processing => {
                rec.status = VersionStatus::Processing;
                self.save(&state)?;
                Ok(())
            }
            other => Err(TabulaError::Registry(format!(
                "cannot mark {dataset} v{version} processing from {other:?}"
            ))),
        }
    }

    /// Flip a version to Ready and advance the dataset's current pointer in
    /// the same mutation. The pointer only ever moves forward.
    pub fn mark_ready(
        &self,
        tenant: &str,
        dataset: &str,
        version: u64,
        schema: Schema,
        row_count: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let ds = dataset_mut(&mut state, tenant, dataset)?;
        let rec = ds
            .version_mut(version)
            .ok_or_else(|| TabulaError::NotFound(format!("{dataset} v{version}")))?;
        match rec.status {
            VersionStatus::Pending | VersionStatus::Processing => {
                rec.status = VersionStatus::Ready;
                rec.schema = Some(schema);
                rec.row_count = Some(row_count);
                if ds.current_version.map_or(true, |cur| version > cur) {
                    ds.current_version = Some(version);
                }
                self.save(&state)?;
                Ok(())
            }
            other => Err(TabulaError::Registry(format!(
                "cannot mark {dataset} v{version} ready from {other:?}"
            ))),
        }
    }

    /// A failed version keeps its number for diagnostics and never becomes
    /// current.
    pub fn mark_failed(
        &self,
        tenant: &str,
        dataset: &str,
        version: u64,
        reason: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let rec = version_mut(&mut state, tenant, dataset, version)?;
        match rec.status {
            VersionStatus::Pending | VersionStatus::Processing => {
                rec.status = VersionStatus::Failed;
                rec.reason = Some(reason.to_string());
                self.save(&state)?;
                Ok(())
            }
            other => Err(TabulaError::Registry(format!(
                "cannot mark {dataset} v{version} failed from {other:?}"
            ))),
        }
    }

    pub fn bump_attempts(&self, tenant: &str, dataset: &str, version: u64) -> Result<u32> {
        let mut state = self.state.lock();
        let rec = version_mut(&mut state, tenant, dataset, version)?;
        rec.attempts += 1;
        let attempts = rec.attempts;
        self.save(&state)?;
        Ok(attempts)
    }

    pub fn get_version(
        &self,
        tenant: &str,
        dataset: &str,
        version: u64,
    ) -> Result<VersionRecord> {
        let state = self.state.lock();
        let ds = dataset_ref(&state, tenant, dataset)?;
        ds.version(version)
            .cloned()
            .ok_or_else(|| TabulaError::NotFound(format!("{dataset} v{version}")))
    }

    /// The newest Ready version, if any.
    pub fn get_current_version(&self, tenant: &str, dataset: &str) -> Result<Option<VersionRecord>> {
        let state = self.state.lock();
        let ds = dataset_ref(&state, tenant, dataset)?;
        Ok(ds
            .current_version
            .and_then(|v| ds.version(v))
            .cloned())
    }

    pub fn get_dataset(&self, tenant: &str, dataset: &str) -> Result<DatasetRecord> {
        let state = self.state.lock();
        dataset_ref(&state, tenant, dataset).cloned()
    }

    pub fn list_datasets(&self, tenant: &str) -> Vec<DatasetRecord> {
        let state = self.state.lock();
        state
            .tenants
            .get(tenant)
            .map(|t| t.datasets.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Jobs that were in flight when the process stopped. Redelivering them
    /// is safe: workers no-op on terminal versions.
    pub fn recoverable_jobs(&self) -> Vec<JobTicket> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for (tenant, trec) in &state.tenants {
            for (dataset, ds) in &trec.datasets {
                for v in &ds.versions {
                    if !v.status.is_terminal() {
                        out.push(JobTicket {
                            tenant: tenant.clone(),
                            dataset_id: dataset.clone(),
                            version: v.version,
                            job_id: v.job_id.clone(),
                            source_ref: v.source_ref.clone(),
                        });
                    }
                }
            }
        }
        out
    }

    pub fn record_query(&self, record: QueryRecord) -> Result<()> {
        let mut state = self.state.lock();
        state.queries.push(record);
        self.save(&state)?;
        Ok(())
    }

    pub fn query_history(&self, tenant: &str, dataset: &str) -> Vec<QueryRecord> {
        let state = self.state.lock();
        state
            .queries
            .iter()
            .filter(|q| q.tenant == tenant && q.dataset_id == dataset)
            .cloned()
            .collect()
    }
}

fn dataset_ref<'a>(
    state: &'a RegistryState,
    tenant: &str,
    dataset: &str,
) -> Result<&'a DatasetRecord> {
    state
        .tenants
        .get(tenant)
        .and_then(|t| t.datasets.get(dataset))
        .ok_or_else(|| TabulaError::NotFound(format!("dataset {dataset} for tenant {tenant}")))
}

fn dataset_mut<'a>(
    state: &'a mut RegistryState,
    tenant: &str,
    dataset: &str,
) -> Result<&'a mut DatasetRecord> {
    state
        .tenants
        .get_mut(tenant)
        .and_then(|t| t.datasets.get_mut(dataset))
        .ok_or_else(|| TabulaError::NotFound(format!("dataset {dataset} for tenant {tenant}")))
}

fn version_mut<'a>(
    state: &'a mut RegistryState,
    tenant: &str,
    dataset: &str,
    version: u64,
) -> Result<&'a mut VersionRecord> {
    let ds = dataset_mut(state, tenant, dataset)?;
    ds.version_mut(version)
        .ok_or_else(|| TabulaError::NotFound(format!("{dataset} v{version}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ColumnDef, ColumnType};

    fn schema() -> Schema {
        Schema::new(vec![ColumnDef {
            name: "n".to_string(),
            column_type: ColumnType::Integer,
        }])
    }

    fn open_registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::load_or_create(dir.path()).unwrap();
        (dir, reg)
    }

    #[test]
    fn version_numbers_monotonic_across_failures() {
        let (_dir, reg) = open_registry();
        reg.create_or_get_dataset("t1", Some("sales")).unwrap();

        let v1 = reg
            .begin_version("t1", "sales", "job-a", Path::new("a.csv"))
            .unwrap();
        let v2 = reg
            .begin_version("t1", "sales", "job-b", Path::new("b.csv"))
            .unwrap();
        assert_eq!((v1, v2), (1, 2));

        reg.mark_processing("t1", "sales", 1).unwrap();
        reg.mark_failed("t1", "sales", 1, "unparsable").unwrap();

        let v3 = reg
            .begin_version("t1", "sales", "job-c", Path::new("c.csv"))
            .unwrap();
        assert_eq!(v3, 3);
    }

    #[test]
    fn current_version_only_advances_on_ready() {
        let (_dir, reg) = open_registry();
        reg.create_or_get_dataset("t1", Some("sales")).unwrap();
        reg.begin_version("t1", "sales", "job-a", Path::new("a.csv"))
            .unwrap();
        assert!(reg.get_current_version("t1", "sales").unwrap().is_none());

        reg.mark_processing("t1", "sales", 1).unwrap();
        reg.mark_ready("t1", "sales", 1, schema(), 10).unwrap();
        let cur = reg.get_current_version("t1", "sales").unwrap().unwrap();
        assert_eq!(cur.version, 1);
        assert_eq!(cur.row_count, Some(10));

        reg.begin_version("t1", "sales", "job-b", Path::new("b.csv"))
            .unwrap();
        reg.mark_failed("t1", "sales", 2, "empty").unwrap();
        let cur = reg.get_current_version("t1", "sales").unwrap().unwrap();
        assert_eq!(cur.version, 1);
    }

    #[test]
    fn terminal_transitions_are_rejected() {
        let (_dir, reg) = open_registry();
        reg.create_or_get_dataset("t1", Some("sales")).unwrap();
        reg.begin_version("t1", "sales", "job-a", Path::new("a.csv"))
            .unwrap();
        reg.mark_ready("t1", "sales", 1, schema(), 1).unwrap();

        assert!(reg.mark_failed("t1", "sales", 1, "late").is_err());
        assert!(reg.mark_processing("t1", "sales", 1).is_err());
        assert!(reg.mark_ready("t1", "sales", 1, schema(), 2).is_err());
        // The original outcome is untouched.
        let rec = reg.get_version("t1", "sales", 1).unwrap();
        assert_eq!(rec.status, VersionStatus::Ready);
        assert_eq!(rec.row_count, Some(1));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = Registry::load_or_create(dir.path()).unwrap();
            reg.create_or_get_dataset("t1", Some("sales")).unwrap();
            reg.begin_version("t1", "sales", "job-a", Path::new("a.csv"))
                .unwrap();
        }
        let reg = Registry::load_or_create(dir.path()).unwrap();
        let rec = reg.get_version("t1", "sales", 1).unwrap();
        assert_eq!(rec.status, VersionStatus::Pending);
        assert_eq!(reg.recoverable_jobs().len(), 1);
    }

    #[test]
    fn generated_dataset_ids_are_distinct() {
        let (_dir, reg) = open_registry();
        let a = reg.create_or_get_dataset("t1", None).unwrap();
        let b = reg.create_or_get_dataset("t1", None).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("ds-"));
    }

    #[test]
    fn query_history_is_tenant_scoped() {
        let (_dir, reg) = open_registry();
        for (tenant, n) in [("t1", 2), ("t2", 1)] {
            for i in 0..n {
                reg.record_query(QueryRecord {
                    query_id: format!("qry-{tenant}-{i}"),
                    tenant: tenant.to_string(),
                    dataset_id: "sales".to_string(),
                    version_used: 1,
                    question: "how many rows".to_string(),
                    generated_sql: None,
                    validation: None,
                    row_count: None,
                    answer: None,
                    raw_answer: None,
                    status: QueryStatus::Answered,
                    created_at_ms: 0,
                })
                .unwrap();
            }
        }
        assert_eq!(reg.query_history("t1", "sales").len(), 2);
        assert_eq!(reg.query_history("t2", "sales").len(), 1);
        assert!(reg.query_history("t3", "sales").is_empty());
    }
}
