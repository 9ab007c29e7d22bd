use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::{AuditLogEntry, AuditQuery, RunStatePatch, StateDocument, StateStore, StorageError};
use crate::agent_state::{AgentRunState, ControlLogEntry};
use crate::leads::{Lead, LeadLifecycleState, LeadPatch};

/// On-disk document: the run-state row, the lead table, and how many bytes of
/// each log file belong to committed writes.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileDocument {
    #[serde(flatten)]
    state: StateDocument,
    #[serde(default)]
    control_log_bytes: u64,
    #[serde(default)]
    audit_log_bytes: u64,
}

#[derive(Debug)]
struct StorePaths {
    document: PathBuf,
    control_log: PathBuf,
    audit_log: PathBuf,
    lock: PathBuf,
}

impl StorePaths {
    fn new(document: PathBuf) -> Self {
        Self {
            control_log: document.with_extension("control.jsonl"),
            audit_log: document.with_extension("audit.jsonl"),
            lock: document.with_extension("lock"),
            document,
        }
    }

    fn lock_file(&self) -> io::Result<RwLock<File>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock)?;
        Ok(RwLock::new(file))
    }

    fn load(&self) -> Result<FileDocument, StorageError> {
        match fs::read_to_string(&self.document) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(FileDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, document: &FileDocument) -> Result<(), StorageError> {
        let serialized = serde_json::to_vec_pretty(document)?;
        let temp_file = format!("{}.tmp", self.document.display());
        let mut file = File::create(&temp_file)?;
        file.write_all(&serialized)?;
        file.sync_all()?;
        fs::rename(&temp_file, &self.document)?;
        debug!(file = ?self.document, "State document written");
        Ok(())
    }
}

/// Append one JSON line at the committed end of `path`, discarding anything an
/// earlier uncommitted write left past it. Returns the new committed length.
fn append_line<T: Serialize>(path: &Path, committed: u64, entry: &T) -> Result<u64, StorageError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    file.set_len(committed)?;
    file.seek(SeekFrom::Start(committed))?;
    file.write_all(&line)?;
    file.sync_data()?;
    Ok(committed + line.len() as u64)
}

/// Committed entries of a log file, oldest first.
fn read_lines<T: DeserializeOwned>(path: &Path, committed: u64) -> Result<Vec<T>, StorageError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for line in BufReader::new(file.take(committed)).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            entries.push(serde_json::from_str(&line)?);
        }
    }
    Ok(entries)
}

async fn blocking<R>(
    f: impl FnOnce() -> Result<R, StorageError> + Send + 'static,
) -> Result<R, StorageError>
where
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Unavailable {
            reason: format!("file store task failed: {e}"),
        })?
}

/// Durable store kept in a JSON document next to two append-only log files.
///
/// Nothing is cached per handle: every call takes an advisory lock on
/// `<path>.lock`, reloads the document and, for mutations, writes it to
/// `<path>.tmp`, syncs and renames it over the original. Several handles and
/// processes can therefore share one store. Log lines only count once the
/// document recording their offset is on disk, so a transition and its
/// control-log entry commit together.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    paths: Arc<StorePaths>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`. Failure here is fatal for the caller.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existed = tokio::fs::try_exists(&path).await?;
        let store = Self {
            paths: Arc::new(StorePaths::new(path)),
        };

        let (leads, state) = store
            .read(|_, doc| Ok((doc.state.leads.len(), doc.state.run_state())))
            .await?;
        if existed {
            info!(file = ?store.path(), leads, state = %state.state, "Loaded state store");
        } else {
            info!(file = ?store.path(), "No existing state file found, starting idle");
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.paths.document
    }

    async fn read<R, F>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&StorePaths, FileDocument) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let paths = Arc::clone(&self.paths);
        blocking(move || {
            let lock = paths.lock_file()?;
            let _guard = lock.read()?;
            let document = paths.load()?;
            f(&paths, document)
        })
        .await
    }

    async fn mutate<R, F>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&StorePaths, &mut FileDocument) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let paths = Arc::clone(&self.paths);
        blocking(move || {
            let mut lock = paths.lock_file()?;
            let _guard = lock.write()?;
            let mut document = paths.load()?;
            let out = f(&paths, &mut document)?;
            paths.persist(&document)?;
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn get_run_state(&self) -> Result<AgentRunState, StorageError> {
        self.read(|_, doc| Ok(doc.state.run_state())).await
    }

    async fn update_run_state(&self, patch: RunStatePatch) -> Result<AgentRunState, StorageError> {
        self.mutate(|_, doc| Ok(doc.state.update_run_state(patch)))
            .await
    }

    async fn commit_transition(
        &self,
        patch: RunStatePatch,
        entry: ControlLogEntry,
    ) -> Result<AgentRunState, StorageError> {
        self.mutate(move |paths, doc| {
            doc.control_log_bytes = append_line(&paths.control_log, doc.control_log_bytes, &entry)?;
            Ok(doc.state.update_run_state(patch))
        })
        .await
    }

    async fn append_control_log(&self, entry: ControlLogEntry) -> Result<(), StorageError> {
        self.mutate(move |paths, doc| {
            doc.control_log_bytes = append_line(&paths.control_log, doc.control_log_bytes, &entry)?;
            Ok(())
        })
        .await
    }

    async fn control_logs(&self, limit: usize) -> Result<Vec<ControlLogEntry>, StorageError> {
        self.read(move |paths, doc| {
            let entries: Vec<ControlLogEntry> =
                read_lines(&paths.control_log, doc.control_log_bytes)?;
            Ok(entries.into_iter().rev().take(limit).collect())
        })
        .await
    }

    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), StorageError> {
        self.mutate(move |paths, doc| {
            doc.audit_log_bytes = append_line(&paths.audit_log, doc.audit_log_bytes, &entry)?;
            Ok(())
        })
        .await
    }

    async fn audit_logs(&self, query: AuditQuery) -> Result<Vec<AuditLogEntry>, StorageError> {
        self.read(move |paths, doc| {
            let entries: Vec<AuditLogEntry> = read_lines(&paths.audit_log, doc.audit_log_bytes)?;
            Ok(entries
                .into_iter()
                .rev()
                .filter(|entry| query.matches(entry))
                .take(query.limit)
                .collect())
        })
        .await
    }

    async fn insert_lead(&self, lead: Lead) -> Result<(), StorageError> {
        self.mutate(move |_, doc| {
            doc.state.leads.insert(lead.id.clone(), lead);
            Ok(())
        })
        .await
    }

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>, StorageError> {
        let id = id.to_string();
        self.read(move |_, mut doc| Ok(doc.state.leads.remove(&id)))
            .await
    }

    async fn update_lead(&self, id: &str, patch: LeadPatch) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.mutate(move |_, doc| Ok(doc.state.update_lead(&id, &patch, Utc::now())))
            .await
    }

    async fn list_leads(&self) -> Result<Vec<Lead>, StorageError> {
        self.read(|_, doc| Ok(doc.state.leads_where(|_| true))).await
    }

    async fn leads_by_lifecycle_state(
        &self,
        state: LeadLifecycleState,
    ) -> Result<Vec<Lead>, StorageError> {
        self.read(move |_, doc| {
            Ok(doc
                .state
                .leads_where(|l| l.effective_lifecycle_state() == state))
        })
        .await
    }

    async fn approved_leads_for_outreach(&self) -> Result<Vec<Lead>, StorageError> {
        self.read(|_, doc| Ok(doc.state.leads_where(Lead::is_outreach_eligible)))
            .await
    }

    async fn leads_for_followup(
        &self,
        delay_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lead>, StorageError> {
        self.read(move |_, doc| {
            Ok(doc
                .state
                .leads_where(|l| l.is_followup_due(delay_days, now)))
        })
        .await
    }
}
