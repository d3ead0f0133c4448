use std::path::Path;

use chrono::Utc;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::ids::{TaskId, WorkflowId};
use crate::types::{
    Attachment, Task, TaskPatch, TaskStatus, Workflow, WorkflowFilter, WorkflowPatch,
    WorkflowStatus,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// helpers — enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

/// Durable store for workflows, tasks, and attachments at `.quorum/state.db`.
///
/// Each entity is persisted as a forward-compatible JSON blob in a `data`
/// column; the columns next to it exist purely for indexed querying. Read-
/// modify-write mutations are not internally serialized: the engine holds a
/// per-workflow mutex around every mutation (persist -> publish discipline).
pub struct WorkflowStore {
    conn: Connection,
}

impl WorkflowStore {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS workflows (
                        id            TEXT PRIMARY KEY,
                        status        TEXT NOT NULL,
                        kanban_column TEXT NOT NULL,
                        created_at    TEXT NOT NULL,
                        data          TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status);
                    CREATE INDEX IF NOT EXISTS idx_workflows_column ON workflows(kanban_column);

                    CREATE TABLE IF NOT EXISTS tasks (
                        workflow_id TEXT NOT NULL,
                        id          TEXT NOT NULL,
                        status      TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        data        TEXT NOT NULL,
                        PRIMARY KEY (workflow_id, id)
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_workflow ON tasks(workflow_id);
                    CREATE INDEX IF NOT EXISTS idx_tasks_status   ON tasks(status);

                    CREATE TABLE IF NOT EXISTS attachments (
                        id          TEXT PRIMARY KEY,
                        workflow_id TEXT NOT NULL,
                        data        TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_attachments_workflow
                        ON attachments(workflow_id);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    pub async fn create_workflow(&self, wf: &Workflow) -> Result<()> {
        let id = wf.id.to_string();
        let status = enum_to_sql(&wf.status);
        let column = enum_to_sql(&wf.kanban_column);
        let created_at = wf.created_at.to_rfc3339();
        let data = serde_json::to_string(wf)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO workflows (id, status, kanban_column, created_at, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id, status, column, created_at, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>> {
        let id_str = id.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM workflows WHERE id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
    }

    /// List workflows, newest first. All filter criteria are ANDed; the
    /// free-text query is applied on the decoded records.
    pub async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT data FROM workflows ORDER BY created_at DESC, id DESC")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await?;

        let mut workflows = Vec::with_capacity(rows.len());
        for raw in rows {
            let wf: Workflow = serde_json::from_str(&raw)?;
            if filter.matches(&wf) {
                workflows.push(wf);
            }
        }
        Ok(workflows)
    }

    /// Read-modify-write a workflow record. Returns the updated record.
    pub async fn update_workflow(
        &self,
        id: &WorkflowId,
        patch: &WorkflowPatch,
    ) -> Result<Workflow> {
        let mut wf = self
            .get_workflow(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("workflow {id}")))?;
        patch.apply(&mut wf);
        self.put_workflow(&wf).await?;
        Ok(wf)
    }

    async fn put_workflow(&self, wf: &Workflow) -> Result<()> {
        let id = wf.id.to_string();
        let status = enum_to_sql(&wf.status);
        let column = enum_to_sql(&wf.kanban_column);
        let data = serde_json::to_string(wf)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE workflows SET status = ?2, kanban_column = ?3, data = ?4
                     WHERE id = ?1",
                    rusqlite::params![id, status, column, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Delete a workflow and everything it owns. Rejected with `Conflict`
    /// while the workflow is running; on-disk artifacts are left in place.
    pub async fn delete_workflow(&self, id: &WorkflowId) -> Result<()> {
        let wf = self
            .get_workflow(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("workflow {id}")))?;
        if wf.status == WorkflowStatus::Running {
            return Err(StoreError::Conflict(format!(
                "workflow {id} is running and cannot be deleted"
            )));
        }

        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM attachments WHERE workflow_id = ?1",
                    rusqlite::params![id_str],
                )?;
                tx.execute(
                    "DELETE FROM tasks WHERE workflow_id = ?1",
                    rusqlite::params![id_str],
                )?;
                tx.execute("DELETE FROM workflows WHERE id = ?1", rusqlite::params![id_str])?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn add_task(&self, task: &Task) -> Result<()> {
        let workflow_id = task.workflow_id.to_string();
        let id = task.id.to_string();
        let status = enum_to_sql(&task.status);
        let created_at = task.created_at.to_rfc3339();
        let data = serde_json::to_string(task)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (workflow_id, id, status, created_at, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![workflow_id, id, status, created_at, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_task(&self, workflow_id: &WorkflowId, id: &TaskId) -> Result<Option<Task>> {
        let wf_str = workflow_id.to_string();
        let id_str = id.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT data FROM tasks WHERE workflow_id = ?1 AND id = ?2")?;
                let mut rows = stmt.query(rusqlite::params![wf_str, id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
    }

    pub async fn list_tasks(&self, workflow_id: &WorkflowId) -> Result<Vec<Task>> {
        let wf_str = workflow_id.to_string();
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT data FROM tasks WHERE workflow_id = ?1
                     ORDER BY created_at ASC, id ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![wf_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await?;
        rows.iter()
            .map(|s| serde_json::from_str(s).map_err(Into::into))
            .collect()
    }

    pub async fn update_task(
        &self,
        workflow_id: &WorkflowId,
        id: &TaskId,
        patch: &TaskPatch,
    ) -> Result<Task> {
        let mut task = self
            .get_task(workflow_id, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {id} in workflow {workflow_id}")))?;
        patch.apply(&mut task);

        let wf_str = workflow_id.to_string();
        let id_str = id.to_string();
        let status = enum_to_sql(&task.status);
        let data = serde_json::to_string(&task)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET status = ?3, data = ?4
                     WHERE workflow_id = ?1 AND id = ?2",
                    rusqlite::params![wf_str, id_str, status, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(task)
    }

    /// Remove every task of a workflow (replan rebuilds the DAG from scratch).
    pub async fn delete_tasks(&self, workflow_id: &WorkflowId) -> Result<usize> {
        let wf_str = workflow_id.to_string();
        let n = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM tasks WHERE workflow_id = ?1",
                    rusqlite::params![wf_str],
                )?;
                Ok(n)
            })
            .await?;
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // Attachments
    // -----------------------------------------------------------------------

    pub async fn add_attachment(&self, attachment: &Attachment) -> Result<()> {
        let id = attachment.id.to_string();
        let workflow_id = attachment.workflow_id.to_string();
        let data = serde_json::to_string(attachment)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attachments (id, workflow_id, data) VALUES (?1, ?2, ?3)",
                    rusqlite::params![id, workflow_id, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_attachment(&self, id: Uuid) -> Result<Option<Attachment>> {
        let id_str = id.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM attachments WHERE id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
    }

    pub async fn list_attachments(&self, workflow_id: &WorkflowId) -> Result<Vec<Attachment>> {
        let wf_str = workflow_id.to_string();
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT data FROM attachments WHERE workflow_id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![wf_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await?;
        rows.iter()
            .map(|s| serde_json::from_str(s).map_err(Into::into))
            .collect()
    }

    /// Delete an attachment by id. Returns `true` when a row was removed.
    pub async fn delete_attachment(&self, id: Uuid) -> Result<bool> {
        let id_str = id.to_string();
        let n = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM attachments WHERE id = ?1",
                    rusqlite::params![id_str],
                )?;
                Ok(n)
            })
            .await?;
        Ok(n > 0)
    }

    // -----------------------------------------------------------------------
    // Crash recovery
    // -----------------------------------------------------------------------

    /// On startup, fail anything left `running` by a previous process.
    /// Returns the ids of the workflows that were transitioned.
    pub async fn recover_interrupted(&self) -> Result<Vec<WorkflowId>> {
        let filter = WorkflowFilter {
            status: Some(WorkflowStatus::Running),
            ..WorkflowFilter::default()
        };
        let interrupted = self.list_workflows(&filter).await?;
        let mut recovered = Vec::with_capacity(interrupted.len());

        for wf in interrupted {
            let now = Utc::now();
            let patch = WorkflowPatch {
                status: Some(WorkflowStatus::Failed),
                finished_at: Some(now),
                ..WorkflowPatch::default()
            }
            .with_error("process restarted");
            self.update_workflow(&wf.id, &patch).await?;

            for task in self.list_tasks(&wf.id).await? {
                if task.status == TaskStatus::Running || task.status == TaskStatus::Queued {
                    let patch = TaskPatch {
                        status: Some(TaskStatus::Failed),
                        finished_at: Some(now),
                        ..TaskPatch::default()
                    }
                    .with_error("process restarted");
                    self.update_task(&wf.id, &task.id, &patch).await?;
                }
            }
            tracing::info!(workflow_id = %wf.id, "interrupted workflow marked failed");
            recovered.push(wf.id);
        }
        Ok(recovered)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionConfig, KanbanColumn};

    async fn store_with_workflow() -> (WorkflowStore, Workflow) {
        let store = WorkflowStore::open_in_memory().await.unwrap();
        let wf = Workflow::new("build the thing", None, ExecutionConfig::default());
        store.create_workflow(&wf).await.unwrap();
        (store, wf)
    }

    #[tokio::test]
    async fn workflow_roundtrip() {
        let (store, wf) = store_with_workflow().await;
        let loaded = store.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, wf.id);
        assert_eq!(loaded.title, wf.title);
        assert_eq!(loaded.status, WorkflowStatus::Pending);
    }

    #[tokio::test]
    async fn update_applies_patch() {
        let (store, wf) = store_with_workflow().await;
        let updated = store
            .update_workflow(
                &wf.id,
                &WorkflowPatch::status(WorkflowStatus::Running).with_phase(crate::types::Phase::Refine),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, WorkflowStatus::Running);
        assert_eq!(updated.current_phase, Some(crate::types::Phase::Refine));
        assert!(updated.updated_at >= wf.updated_at);
    }

    #[tokio::test]
    async fn delete_running_is_conflict() {
        let (store, wf) = store_with_workflow().await;
        store
            .update_workflow(&wf.id, &WorkflowPatch::status(WorkflowStatus::Running))
            .await
            .unwrap();

        let err = store.delete_workflow(&wf.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store
            .update_workflow(&wf.id, &WorkflowPatch::status(WorkflowStatus::Stopped))
            .await
            .unwrap();
        store.delete_workflow(&wf.id).await.unwrap();
        assert!(store.get_workflow(&wf.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_cascades_to_tasks_and_attachments() {
        let (store, wf) = store_with_workflow().await;
        let task = Task::new(
            TaskId::new("task-01"),
            wf.id.clone(),
            "write tests",
            "claude",
            vec![],
            600,
        );
        store.add_task(&task).await.unwrap();
        let att = Attachment::new(wf.id.clone(), "notes.md", 12, "deadbeef", "/tmp/notes.md");
        store.add_attachment(&att).await.unwrap();

        store.delete_workflow(&wf.id).await.unwrap();
        assert!(store.list_tasks(&wf.id).await.unwrap().is_empty());
        assert!(store.list_attachments(&wf.id).await.unwrap().is_empty());
        assert!(store.get_attachment(att.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_are_anded() {
        let store = WorkflowStore::open_in_memory().await.unwrap();
        let mut a = Workflow::new("parser work", None, ExecutionConfig::default());
        a.kanban_column = KanbanColumn::Todo;
        let mut b = Workflow::new("compiler work", None, ExecutionConfig::default());
        b.kanban_column = KanbanColumn::Done;
        store.create_workflow(&a).await.unwrap();
        store.create_workflow(&b).await.unwrap();

        let filter = WorkflowFilter {
            kanban_column: Some(KanbanColumn::Todo),
            query: Some("parser".into()),
            ..WorkflowFilter::default()
        };
        let got = store.list_workflows(&filter).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, a.id);
    }

    #[tokio::test]
    async fn task_roundtrip_and_update() {
        let (store, wf) = store_with_workflow().await;
        let task = Task::new(
            TaskId::new("task-01"),
            wf.id.clone(),
            "implement",
            "gemini",
            vec![TaskId::new("task-00")],
            600,
        );
        store.add_task(&task).await.unwrap();

        let loaded = store.get_task(&wf.id, &task.id).await.unwrap().unwrap();
        assert_eq!(loaded.agent, "gemini");
        assert_eq!(loaded.depends_on, vec![TaskId::new("task-00")]);

        let updated = store
            .update_task(
                &wf.id,
                &task.id,
                &TaskPatch {
                    status: Some(TaskStatus::Completed),
                    output: Some("done".into()),
                    attempts: Some(1),
                    ..TaskPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Completed);
        assert_eq!(updated.output.as_deref(), Some("done"));
        assert_eq!(updated.attempts, 1);
    }

    #[tokio::test]
    async fn reload_from_disk_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let wf = {
            let store = WorkflowStore::open(&path).await.unwrap();
            let wf = Workflow::new("persist me", None, ExecutionConfig::default());
            store.create_workflow(&wf).await.unwrap();
            let task = Task::new(
                TaskId::new("task-01"),
                wf.id.clone(),
                "step",
                "claude",
                vec![],
                600,
            );
            store.add_task(&task).await.unwrap();
            wf
        };

        let store = WorkflowStore::open(&path).await.unwrap();
        let loaded = store.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.prompt, "persist me");
        assert_eq!(store.list_tasks(&wf.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recovery_fails_interrupted_runs() {
        let (store, wf) = store_with_workflow().await;
        store
            .update_workflow(&wf.id, &WorkflowPatch::status(WorkflowStatus::Running))
            .await
            .unwrap();
        let task = Task::new(
            TaskId::new("task-01"),
            wf.id.clone(),
            "step",
            "claude",
            vec![],
            600,
        );
        store.add_task(&task).await.unwrap();
        store
            .update_task(&wf.id, &task.id, &TaskPatch::status(TaskStatus::Queued))
            .await
            .unwrap();

        let recovered = store.recover_interrupted().await.unwrap();
        assert_eq!(recovered, vec![wf.id.clone()]);

        let wf = store.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.error.as_deref(), Some("process restarted"));

        let task = store.get_task(&wf.id, &task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }
}
