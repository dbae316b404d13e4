use super::state::SwarmState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use taskforge_core::TaskforgeResult;
use tracing::debug;
use uuid::Uuid;

/// Storage for workflow snapshots keyed by run id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, state: &SwarmState) -> TaskforgeResult<()>;

    async fn load(&self, run_id: &Uuid) -> TaskforgeResult<Option<SwarmState>>;

    async fn remove(&self, run_id: &Uuid) -> TaskforgeResult<()>;

    async fn list(&self) -> TaskforgeResult<Vec<Uuid>>;
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    states: Mutex<HashMap<Uuid, SwarmState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, state: &SwarmState) -> TaskforgeResult<()> {
        self.states.lock().insert(state.run_id, state.clone());
        Ok(())
    }

    async fn load(&self, run_id: &Uuid) -> TaskforgeResult<Option<SwarmState>> {
        Ok(self.states.lock().get(run_id).cloned())
    }

    async fn remove(&self, run_id: &Uuid) -> TaskforgeResult<()> {
        self.states.lock().remove(run_id);
        Ok(())
    }

    async fn list(&self) -> TaskforgeResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.states.lock().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One `<run id>.json` file per run. Writes go to a temporary file first and
/// are renamed into place.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub async fn open(dir: impl Into<PathBuf>) -> TaskforgeResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, run_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, state: &SwarmState) -> TaskforgeResult<()> {
        let path = self.path_for(&state.run_id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(run_id = %state.run_id, phase = %state.phase, "Checkpoint written");
        Ok(())
    }

    async fn load(&self, run_id: &Uuid) -> TaskforgeResult<Option<SwarmState>> {
        match tokio::fs::read(self.path_for(run_id)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, run_id: &Uuid) -> TaskforgeResult<()> {
        match tokio::fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> TaskforgeResult<Vec<Uuid>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::swarm::types::{Failure, WorkflowPhase};
    use taskforge_core::FailurePriority;

    fn state() -> SwarmState {
        let mut state = SwarmState::new(
            vec![Failure::new("io", "disk full", "fs", FailurePriority::High)],
            HashMap::new(),
        );
        state.phase = WorkflowPhase::Assign;
        state.visited = vec![WorkflowPhase::Collect, WorkflowPhase::Analyze];
        state
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path().join("checkpoints"))
            .await
            .unwrap();
        let state = state();
        store.save(&state).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![state.run_id]);
        assert_eq!(store.load(&state.run_id).await.unwrap(), Some(state.clone()));

        store.remove(&state.run_id).await.unwrap();
        assert!(store.load(&state.run_id).await.unwrap().is_none());
        store.remove(&state.run_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_overwrites() {
        let store = MemoryCheckpointStore::new();
        let mut state = state();
        store.save(&state).await.unwrap();
        state.phase = WorkflowPhase::Report;
        store.save(&state).await.unwrap();
        let loaded = store.load(&state.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.phase, WorkflowPhase::Report);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
