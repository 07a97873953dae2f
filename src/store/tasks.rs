//! TaskStore: whole-document persistence for tasks.
//!
//! Each task lives at `<root>/<id>/task.json`. Writes go to a sibling temp
//! file first and are renamed into place, so a reader never sees a torn
//! document. All file I/O runs on the blocking pool.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::tasks::PersistedTask;

const TASK_FILE: &str = "task.json";

/// Durable per-task document store.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by one task. Artifact directories are created beneath it.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    /// Atomically replace the stored document for `task.record.id`.
    pub async fn save(&self, task: &PersistedTask) -> Result<(), StoreError> {
        let dir = self.task_dir(&task.record.id);
        let body = serde_json::to_vec_pretty(task)?;
        let task_id = task.record.id.clone();

        tokio::task::spawn_blocking(move || write_atomic(&dir, &body))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))??;

        debug!(task_id = %task_id, "Task persisted");
        Ok(())
    }

    /// Load one task document.
    pub async fn load(&self, task_id: &str) -> Result<PersistedTask, StoreError> {
        let path = self.task_dir(task_id).join(TASK_FILE);
        let raw = tokio::task::spawn_blocking({
            let path = path.clone();
            move || std::fs::read(&path)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
        .map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Load every readable task under the root.
    ///
    /// A document that cannot be read or parsed is logged and skipped. It is
    /// left on disk untouched so an operator can inspect it.
    pub async fn load_all(&self) -> Result<Vec<PersistedTask>, StoreError> {
        let root = self.root.clone();
        let docs = tokio::task::spawn_blocking(move || read_all(&root))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))??;

        let mut tasks = Vec::with_capacity(docs.len());
        for (path, raw) in docs {
            match serde_json::from_slice::<PersistedTask>(&raw) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable task file")
                }
            }
        }
        info!(count = tasks.len(), root = %self.root.display(), "Loaded persisted tasks");
        Ok(tasks)
    }

    /// Remove a task's whole directory tree. Missing directories are fine.
    pub async fn delete(&self, task_id: &str) -> Result<(), StoreError> {
        let dir = self.task_dir(task_id);
        tokio::task::spawn_blocking(move || match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: dir.display().to_string(),
                source,
            }),
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;
        debug!(task_id = %task_id, "Task files removed");
        Ok(())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn write_atomic(dir: &Path, body: &[u8]) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir).map_err(io_err(dir))?;
    let tmp = dir.join(format!("{TASK_FILE}.tmp"));
    let target = dir.join(TASK_FILE);
    std::fs::write(&tmp, body).map_err(io_err(&tmp))?;
    std::fs::rename(&tmp, &target).map_err(io_err(&target))?;
    Ok(())
}

fn read_all(root: &Path) -> Result<Vec<(PathBuf, Vec<u8>)>, StoreError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: root.display().to_string(),
                source,
            });
        }
    };

    let mut docs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path().join(TASK_FILE);
        if !path.is_file() {
            continue;
        }
        match std::fs::read(&path) {
            Ok(raw) => docs.push((path, raw)),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to read task file"),
        }
    }
    Ok(docs)
}
