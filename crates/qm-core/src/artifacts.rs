use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use crate::ids::WorkflowId;
use crate::types::Phase;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid artifact path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

// ---------------------------------------------------------------------------
// ArtifactRef
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    /// Path relative to the workflow's run directory.
    pub rel_path: String,
    /// Absolute on-disk path.
    pub path: PathBuf,
    pub size_bytes: u64,
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

/// Append-only artifact tree under `<data_dir>/runs/<workflow-id>/`.
///
/// Writes land in a `.tmp` sibling first and are atomically renamed into
/// place. Canonical paths are write-once; retries write to sibling paths and
/// only the final artifact is linked into the workflow record. Idempotent
/// phases (refine) use [`ArtifactStore::write_overwrite`].
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    runs_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_root: data_dir.into().join("runs"),
        }
    }

    /// Root directory of one workflow's artifacts.
    pub fn run_dir(&self, workflow_id: &WorkflowId) -> PathBuf {
        self.runs_root.join(workflow_id.as_str())
    }

    fn resolve(&self, workflow_id: &WorkflowId, rel_path: &str) -> Result<PathBuf> {
        // Reject traversal out of the run directory.
        let rel = Path::new(rel_path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ArtifactError::InvalidPath(rel_path.to_string()));
        }
        Ok(self.run_dir(workflow_id).join(rel))
    }

    /// Write-once: fails with `AlreadyExists` if the canonical path is taken.
    pub async fn write(
        &self,
        workflow_id: &WorkflowId,
        rel_path: &str,
        bytes: &[u8],
    ) -> Result<ArtifactRef> {
        let path = self.resolve(workflow_id, rel_path)?;
        if tokio::fs::try_exists(&path).await? {
            return Err(ArtifactError::AlreadyExists(rel_path.to_string()));
        }
        self.write_atomic(&path, bytes).await?;
        Ok(ArtifactRef {
            rel_path: rel_path.to_string(),
            path,
            size_bytes: bytes.len() as u64,
        })
    }

    /// Overwrite variant for idempotent phases (re-running refine replaces
    /// the refined prompt in place).
    pub async fn write_overwrite(
        &self,
        workflow_id: &WorkflowId,
        rel_path: &str,
        bytes: &[u8],
    ) -> Result<ArtifactRef> {
        let path = self.resolve(workflow_id, rel_path)?;
        self.write_atomic(&path, bytes).await?;
        Ok(ArtifactRef {
            rel_path: rel_path.to_string(),
            path,
            size_bytes: bytes.len() as u64,
        })
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!(
            "{}tmp",
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| format!("{e}."))
                .unwrap_or_default()
        ));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Sibling path for attempt `n` of a retried artifact:
    /// `output.txt` -> `output.retry2.txt`.
    pub fn retry_path(rel_path: &str, attempt: u32) -> String {
        let p = Path::new(rel_path);
        let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or(rel_path);
        let ext = p
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        match p.parent().filter(|d| !d.as_os_str().is_empty()) {
            Some(dir) => format!("{}/{stem}.retry{attempt}{ext}", dir.display()),
            None => format!("{stem}.retry{attempt}{ext}"),
        }
    }

    pub async fn read(&self, workflow_id: &WorkflowId, rel_path: &str) -> Result<Vec<u8>> {
        let path = self.resolve(workflow_id, rel_path)?;
        Ok(tokio::fs::read(path).await?)
    }

    pub async fn read_to_string(&self, workflow_id: &WorkflowId, rel_path: &str) -> Result<String> {
        let path = self.resolve(workflow_id, rel_path)?;
        Ok(tokio::fs::read_to_string(path).await?)
    }

    pub async fn exists(&self, workflow_id: &WorkflowId, rel_path: &str) -> Result<bool> {
        let path = self.resolve(workflow_id, rel_path)?;
        Ok(tokio::fs::try_exists(path).await?)
    }

    /// List entry names directly under `prefix`, alphabetical with embedded
    /// integers ordered numerically (`v2` before `v10`, `task-2` before
    /// `task-10`).
    pub async fn list(&self, workflow_id: &WorkflowId, prefix: &str) -> Result<Vec<String>> {
        let dir = if prefix.is_empty() {
            self.run_dir(workflow_id)
        } else {
            self.resolve(workflow_id, prefix)?
        };
        let mut names = Vec::new();
        match tokio::fs::read_dir(&dir).await {
            Ok(mut read_dir) => {
                while let Some(entry) = read_dir.next_entry().await? {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        names.sort_by(|a, b| natural_cmp(a, b));
        Ok(names)
    }

    /// Next analysis round number: scans existing `v<N>` directories and
    /// returns `max + 1` (1 when none exist).
    pub async fn next_round(&self, workflow_id: &WorkflowId, phase_dir: &str) -> Result<u32> {
        let entries = self.list(workflow_id, phase_dir).await?;
        let max = entries
            .iter()
            .filter_map(|name| name.strip_prefix('v').and_then(|n| n.parse::<u32>().ok()))
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    /// Remove a phase's artifact directory (replan discards execute output).
    pub async fn discard_phase(&self, workflow_id: &WorkflowId, phase: Phase) -> Result<()> {
        let dir = self.run_dir(workflow_id).join(phase.artifact_dir());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove stray `.tmp` files left by interrupted writes.
    pub async fn finalize(&self, workflow_id: &WorkflowId) -> Result<()> {
        let root = self.run_dir(workflow_id);
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Natural ordering
// ---------------------------------------------------------------------------

/// Compare strings run-by-run, treating digit runs as integers.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ia = a.chars().peekable();
    let mut ib = b.chars().peekable();
    loop {
        match (ia.peek().copied(), ib.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let na = take_number(&mut ia);
                    let nb = take_number(&mut ib);
                    match na.cmp(&nb) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                match ca.cmp(&cb) {
                    Ordering::Equal => {
                        ia.next();
                        ib.next();
                    }
                    other => return other,
                }
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> u64 {
    let mut n: u64 = 0;
    while let Some(c) = chars.peek().copied() {
        if let Some(d) = c.to_digit(10) {
            n = n.saturating_mul(10).saturating_add(d as u64);
            chars.next();
        } else {
            break;
        }
    }
    n
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
