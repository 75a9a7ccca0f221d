//! File-backed implementation of WorkflowEventStore
//!
//! Each run gets its own directory under the store root:
//!
//! ```text
//! <root>/<run_id>/execution.json   execution record, replaced atomically
//! <root>/<run_id>/events.jsonl     one event per line, append-only
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::ledger::Ledger;
use super::store::*;
use crate::workflow::{Event, NewEvent};

const EXECUTION_FILE: &str = "execution.json";
const EXECUTION_TMP: &str = "execution.json.tmp";
const EVENTS_FILE: &str = "events.jsonl";

/// Durable store writing JSON files under a root directory
///
/// Appends are fsynced before they are acknowledged. A crash in the middle
/// of an append leaves at most one unterminated trailing line, which is
/// dropped the next time the store is opened.
///
/// The whole store is loaded into memory on open; writes go to disk first
/// and to memory only once they are durable. Disk writes run on the blocking
/// pool while the ledger lock is held, so writes to the store are serialized.
pub struct FileWorkflowEventStore {
    root: PathBuf,
    ledger: Mutex<Ledger>,
}

impl FileWorkflowEventStore {
    /// Open (or create) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut loaded = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let execution = match read_execution(&dir)? {
                Some(execution) => execution,
                None => {
                    warn!(dir = %dir.display(), "skipping run directory without execution record");
                    continue;
                }
            };
            let events = read_events(&dir.join(EVENTS_FILE))?;
            loaded.push((execution, events));
        }

        loaded.sort_by_key(|(execution, _)| execution.created_at);

        let mut ledger = Ledger::default();
        for (execution, events) in loaded {
            ledger.insert(execution, events);
        }
        info!(root = %root.display(), executions = ledger.len(), "opened file event store");

        Ok(Self {
            root,
            ledger: Mutex::new(ledger),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, id: &ExecutionId) -> PathBuf {
        self.root.join(id.run_id.to_string())
    }
}

#[async_trait]
impl WorkflowEventStore for FileWorkflowEventStore {
    async fn create_execution(&self, execution: WorkflowExecution) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock().await;
        ledger.check_create(&execution)?;

        let dir = self.run_dir(&execution.id);
        let record = execution.clone();
        blocking(move || {
            fs::create_dir_all(&dir)?;
            write_execution(&dir, &record)
        })
        .await?;

        ledger.insert(execution, Vec::new());
        Ok(())
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<WorkflowExecution, StoreError> {
        self.ledger.lock().await.get(id).cloned()
    }

    async fn latest_run(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.ledger.lock().await.latest_run(workflow_id).cloned())
    }

    async fn list_executions(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        Ok(self.ledger.lock().await.list(status))
    }

    async fn update_execution(
        &self,
        id: &ExecutionId,
        update: ExecutionUpdate,
    ) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock().await;
        let mut execution = ledger.get(id)?.clone();
        execution.apply(update);

        let dir = self.run_dir(id);
        let record = execution.clone();
        blocking(move || write_execution(&dir, &record)).await?;
        ledger.replace(execution)
    }

    async fn append_event(
        &self,
        id: &ExecutionId,
        expected_sequence: u64,
        event: NewEvent,
    ) -> Result<u64, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let event = ledger.check_append(id, expected_sequence, event)?;

        let path = self.run_dir(id).join(EVENTS_FILE);
        let line = event.clone();
        blocking(move || append_line(&path, &line)).await?;
        debug!(execution = %id, sequence = event.sequence, event_id = %event.event_id, "appended event");

        ledger.commit_append(id, event)
    }

    async fn load_events(&self, id: &ExecutionId) -> Result<Vec<Event>, StoreError> {
        Ok(self.ledger.lock().await.events(id)?.to_vec())
    }

    async fn next_sequence(&self, id: &ExecutionId) -> Result<u64, StoreError> {
        Ok(self.ledger.lock().await.events(id)?.len() as u64)
    }
}

/// Run filesystem work on the blocking pool
async fn blocking<T, F>(work: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Io(io::Error::other(e)))?
}

fn read_execution(dir: &Path) -> Result<Option<WorkflowExecution>, StoreError> {
    let bytes = match fs::read(dir.join(EXECUTION_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Replace the execution record through a temp file and a rename
fn write_execution(dir: &Path, execution: &WorkflowExecution) -> Result<(), StoreError> {
    let tmp = dir.join(EXECUTION_TMP);
    let mut file = File::create(&tmp)?;
    serde_json::to_writer_pretty(&mut file, execution)?;
    file.sync_all()?;
    fs::rename(&tmp, dir.join(EXECUTION_FILE))?;
    Ok(())
}

fn append_line(path: &Path, event: &Event) -> Result<(), StoreError> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    write_or_truncate(&mut file, |file| {
        file.write_all(line.as_bytes())?;
        file.sync_data()
    })?;
    Ok(())
}

/// Run `write` at the end of `file`, cutting it back to its previous length
/// if the write fails
///
/// A failed append must not leave partial bytes that the next line would
/// be written after.
fn write_or_truncate(
    file: &mut File,
    write: impl FnOnce(&mut File) -> io::Result<()>,
) -> io::Result<()> {
    let len = file.metadata()?.len();
    if let Err(e) = write(file) {
        if let Err(rollback) = file.set_len(len).and_then(|()| file.sync_data()) {
            error!(error = %rollback, "failed to roll back partial append");
        }
        return Err(e);
    }
    Ok(())
}

/// Read an event log, dropping a torn trailing line
fn read_events(path: &Path) -> Result<Vec<Event>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut events: Vec<Event> = Vec::new();
    let mut offset = 0;
    while let Some(len) = bytes[offset..].iter().position(|b| *b == b'\n') {
        let line = &bytes[offset..offset + len];
        offset += len + 1;
        if line.is_empty() {
            continue;
        }

        let event: Event = serde_json::from_slice(line).map_err(|e| {
            StoreError::Corrupted(format!(
                "{}: event {}: {}",
                path.display(),
                events.len(),
                e
            ))
        })?;
        if event.sequence != events.len() as u64 {
            return Err(StoreError::Corrupted(format!(
                "{}: expected sequence {}, found {}",
                path.display(),
                events.len(),
                event.sequence
            )));
        }
        events.push(event);
    }

    if offset < bytes.len() {
        warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - offset,
            "dropping torn trailing event"
        );
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(offset as u64)?;
    }

    Ok(events)
}
