use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use cadence_types::{Checkpoint, EventEnvelope, Run, RunStatus, Session};

/// Run/event/checkpoint store port. The in-memory implementation is part
/// of the contract, not a fallback for tests only.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: Run) -> anyhow::Result<()>;
    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> anyhow::Result<()>;
    async fn list_runs(&self) -> anyhow::Result<Vec<Run>>;
    async fn save_event(&self, envelope: EventEnvelope) -> anyhow::Result<()>;
    async fn get_events(&self, run_id: &str) -> anyhow::Result<Vec<EventEnvelope>>;
    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> anyhow::Result<()>;
    async fn list_checkpoints(&self, run_id: &str) -> anyhow::Result<Vec<Checkpoint>>;
    async fn get_latest_checkpoint(&self, run_id: &str) -> anyhow::Result<Option<Checkpoint>>;
    async fn save_session(&self, session: Session) -> anyhow::Result<()>;
    async fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>>;
    async fn delete_run(&self, run_id: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
struct MemoryTables {
    runs: HashMap<String, Run>,
    events: HashMap<String, Vec<EventEnvelope>>,
    checkpoints: HashMap<String, Vec<Checkpoint>>,
    sessions: HashMap<String, Session>,
}

pub struct MemoryRunStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(MemoryTables::default()),
        }
    }
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: Run) -> anyhow::Result<()> {
        self.tables.write().await.runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        let Some(run) = tables.runs.get_mut(run_id) else {
            anyhow::bail!("unknown run `{run_id}`");
        };
        run.status = status;
        run.updated_at = Utc::now();
        if matches!(
            status,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        ) {
            run.completed_at = Some(run.updated_at);
        }
        Ok(())
    }

    async fn list_runs(&self) -> anyhow::Result<Vec<Run>> {
        let mut runs = self
            .tables
            .read()
            .await
            .runs
            .values()
            .cloned()
            .collect::<Vec<_>>();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn save_event(&self, envelope: EventEnvelope) -> anyhow::Result<()> {
        self.tables
            .write()
            .await
            .events
            .entry(envelope.run_id.clone())
            .or_default()
            .push(envelope);
        Ok(())
    }

    async fn get_events(&self, run_id: &str) -> anyhow::Result<Vec<EventEnvelope>> {
        Ok(self
            .tables
            .read()
            .await
            .events
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> anyhow::Result<()> {
        self.tables
            .write()
            .await
            .checkpoints
            .entry(checkpoint.run_id.clone())
            .or_default()
            .push(checkpoint);
        Ok(())
    }

    async fn list_checkpoints(&self, run_id: &str) -> anyhow::Result<Vec<Checkpoint>> {
        Ok(self
            .tables
            .read()
            .await
            .checkpoints
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_latest_checkpoint(&self, run_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        Ok(self
            .tables
            .read()
            .await
            .checkpoints
            .get(run_id)
            .and_then(|list| list.last().cloned()))
    }

    async fn save_session(&self, session: Session) -> anyhow::Result<()> {
        self.tables
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        Ok(self.tables.read().await.sessions.get(id).cloned())
    }

    async fn delete_run(&self, run_id: &str) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        tables.runs.remove(run_id);
        tables.events.remove(run_id);
        tables.checkpoints.remove(run_id);
        tables.sessions.retain(|_, s| s.run_id != run_id);
        Ok(())
    }
}

/// JSON documents under a base directory. Runs, checkpoints, and sessions
/// hydrate at startup and flush on every write; events append to one
/// JSONL file per run.
pub struct FileRunStore {
    base: PathBuf,
    tables: RwLock<MemoryTables>,
}

impl FileRunStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(base.join("events")).await?;

        let runs = read_json_map::<Run>(&base.join("runs.json")).await;
        let sessions = read_json_map::<Session>(&base.join("sessions.json")).await;
        let checkpoints =
            read_json_map::<Vec<Checkpoint>>(&base.join("checkpoints.json")).await;

        Ok(Self {
            base,
            tables: RwLock::new(MemoryTables {
                runs,
                events: HashMap::new(),
                checkpoints,
                sessions,
            }),
        })
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let tables = self.tables.read().await;
        write_json(&self.base.join("runs.json"), &tables.runs).await?;
        write_json(&self.base.join("sessions.json"), &tables.sessions).await?;
        write_json(&self.base.join("checkpoints.json"), &tables.checkpoints).await?;
        Ok(())
    }

    fn events_path(&self, run_id: &str) -> PathBuf {
        self.base.join("events").join(format!("{run_id}.jsonl"))
    }
}

async fn read_json_map<T: serde::de::DeserializeOwned>(path: &Path) -> HashMap<String, T> {
    match fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn create_run(&self, run: Run) -> anyhow::Result<()> {
        self.tables.write().await.runs.insert(run.id.clone(), run);
        self.flush().await
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> anyhow::Result<()> {
        {
            let mut tables = self.tables.write().await;
            let Some(run) = tables.runs.get_mut(run_id) else {
                anyhow::bail!("unknown run `{run_id}`");
            };
            run.status = status;
            run.updated_at = Utc::now();
            if matches!(
                status,
                RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
            ) {
                run.completed_at = Some(run.updated_at);
            }
        }
        self.flush().await
    }

    async fn list_runs(&self) -> anyhow::Result<Vec<Run>> {
        let mut runs = self
            .tables
            .read()
            .await
            .runs
            .values()
            .cloned()
            .collect::<Vec<_>>();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn save_event(&self, envelope: EventEnvelope) -> anyhow::Result<()> {
        let path = self.events_path(&envelope.run_id);
        let line = serde_json::to_string(&envelope)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn get_events(&self, run_id: &str) -> anyhow::Result<Vec<EventEnvelope>> {
        let raw = match fs::read_to_string(self.events_path(run_id)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> anyhow::Result<()> {
        self.tables
            .write()
            .await
            .checkpoints
            .entry(checkpoint.run_id.clone())
            .or_default()
            .push(checkpoint);
        self.flush().await
    }

    async fn list_checkpoints(&self, run_id: &str) -> anyhow::Result<Vec<Checkpoint>> {
        Ok(self
            .tables
            .read()
            .await
            .checkpoints
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_latest_checkpoint(&self, run_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        Ok(self
            .tables
            .read()
            .await
            .checkpoints
            .get(run_id)
            .and_then(|list| list.last().cloned()))
    }

    async fn save_session(&self, session: Session) -> anyhow::Result<()> {
        self.tables
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session);
        self.flush().await
    }

    async fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        Ok(self.tables.read().await.sessions.get(id).cloned())
    }

    async fn delete_run(&self, run_id: &str) -> anyhow::Result<()> {
        {
            let mut tables = self.tables.write().await;
            tables.runs.remove(run_id);
            tables.checkpoints.remove(run_id);
            tables.sessions.retain(|_, s| s.run_id != run_id);
        }
        let _ = fs::remove_file(self.events_path(run_id)).await;
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::{Actor, EventType, RedactionLevel, WorkflowState, EVENT_VERSION};
    use serde_json::json;

    fn run() -> Run {
        Run::new("proj-1", "/tmp/work", json!({}))
    }

    fn envelope(run_id: &str) -> EventEnvelope {
        EventEnvelope {
            event_version: EVENT_VERSION.to_string(),
            run_id: run_id.to_string(),
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            state: WorkflowState::PrdIntake,
            actor: Actor::System,
            event_type: EventType::TurnStart,
            correlation_id: "corr".to_string(),
            payload: json!({}),
            redaction_level: RedactionLevel::None,
        }
    }

    #[tokio::test]
    async fn memory_store_round_trips_runs_and_events() {
        let store = MemoryRunStore::new();
        let run = run();
        let run_id = run.id.clone();
        store.create_run(run).await.unwrap();
        store.save_event(envelope(&run_id)).await.unwrap();
        store.save_event(envelope(&run_id)).await.unwrap();

        assert_eq!(store.list_runs().await.unwrap().len(), 1);
        assert_eq!(store.get_events(&run_id).await.unwrap().len(), 2);

        store
            .update_run_status(&run_id, RunStatus::Cancelled)
            .await
            .unwrap();
        let stored = store.list_runs().await.unwrap().remove(0);
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn memory_store_tracks_latest_checkpoint() {
        let store = MemoryRunStore::new();
        let first = Checkpoint::new("run-9", WorkflowState::Implementing, json!({}), None);
        let second = Checkpoint::new("run-9", WorkflowState::Qa, json!({}), None);
        store.save_checkpoint(first).await.unwrap();
        store.save_checkpoint(second.clone()).await.unwrap();

        let latest = store.get_latest_checkpoint("run-9").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(store.list_checkpoints("run-9").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_run_removes_owned_rows() {
        let store = MemoryRunStore::new();
        let run = run();
        let run_id = run.id.clone();
        store.create_run(run).await.unwrap();
        store.save_event(envelope(&run_id)).await.unwrap();
        store
            .save_session(Session::new(&run_id, "a session"))
            .await
            .unwrap();

        store.delete_run(&run_id).await.unwrap();
        assert!(store.list_runs().await.unwrap().is_empty());
        assert!(store.get_events(&run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_hydrates_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run = run();
        let run_id = run.id.clone();
        {
            let store = FileRunStore::new(dir.path()).await.unwrap();
            store.create_run(run).await.unwrap();
            store.save_event(envelope(&run_id)).await.unwrap();
            store
                .save_checkpoint(Checkpoint::new(
                    &run_id,
                    WorkflowState::Implementing,
                    json!({"note": "mid-build"}),
                    Some("before qa".to_string()),
                ))
                .await
                .unwrap();
        }

        let reopened = FileRunStore::new(dir.path()).await.unwrap();
        assert_eq!(reopened.list_runs().await.unwrap().len(), 1);
        assert_eq!(reopened.get_events(&run_id).await.unwrap().len(), 1);
        let checkpoint = reopened
            .get_latest_checkpoint(&run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.description.as_deref(), Some("before qa"));
    }

    #[tokio::test]
    async fn file_store_delete_run_drops_the_event_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::new(dir.path()).await.unwrap();
        let run = run();
        let run_id = run.id.clone();
        store.create_run(run).await.unwrap();
        store.save_event(envelope(&run_id)).await.unwrap();

        store.delete_run(&run_id).await.unwrap();
        assert!(store.get_events(&run_id).await.unwrap().is_empty());
        assert!(store.list_runs().await.unwrap().is_empty());
    }
}
