//! Hash-verified undo metadata for file mutations.
//!
//! Every mutation records `{before_hash, after_hash, backup}`. Undo refuses
//! to restore when the file on disk no longer matches the recorded
//! after-hash, unless `force` is set — a later edit would otherwise be
//! silently destroyed.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

/// One recorded mutation.
#[derive(Debug, Clone)]
pub struct UndoRecord {
    pub id: String,
    pub path: PathBuf,
    /// None when the mutation created the file.
    pub before_hash: Option<String>,
    pub after_hash: String,
    /// Copy of the pre-mutation content; None for newly created files.
    pub backup: Option<PathBuf>,
    pub recorded_at: DateTime<Utc>,
}

/// Pre-mutation snapshot handed back to the caller between `snapshot_before`
/// and `record`.
#[derive(Debug, Clone)]
pub struct BeforeState {
    pub hash: Option<String>,
    pub backup: Option<PathBuf>,
}

#[derive(Debug)]
pub enum UndoError {
    /// Current file hash does not match the recorded after-hash.
    Conflict { expected: String, actual: String },
    NoRecord(PathBuf),
    MissingBackup(PathBuf),
    Io(std::io::Error),
}

impl fmt::Display for UndoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoError::Conflict { expected, actual } => write!(
                f,
                "file changed since the recorded mutation (expected {expected}, found {actual}); \
                 pass force to restore anyway"
            ),
            UndoError::NoRecord(path) => {
                write!(f, "no undo record for {}", path.display())
            }
            UndoError::MissingBackup(path) => {
                write!(f, "backup missing for {}", path.display())
            }
            UndoError::Io(err) => write!(f, "undo io error: {err}"),
        }
    }
}

impl std::error::Error for UndoError {}

impl From<std::io::Error> for UndoError {
    fn from(err: std::io::Error) -> Self {
        UndoError::Io(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    /// Pre-mutation content restored from backup.
    Restored,
    /// The mutation created the file; undo deleted it.
    Deleted,
}

/// Session-scoped mutation journal.
pub struct UndoLog {
    backup_dir: PathBuf,
    records: RwLock<Vec<UndoRecord>>,
}

impl UndoLog {
    pub fn new(backup_dir: PathBuf) -> Self {
        Self {
            backup_dir,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Hash and back up the current content of `path`, if it exists.
    /// Call before mutating; pass the result to [`UndoLog::record`] after.
    pub async fn snapshot_before(&self, path: &Path) -> Result<BeforeState, UndoError> {
        if !path.exists() {
            return Ok(BeforeState {
                hash: None,
                backup: None,
            });
        }
        let content = tokio::fs::read(path).await?;
        let hash = hash_bytes(&content);
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let backup = self
            .backup_dir
            .join(format!("{}.bak", uuid::Uuid::new_v4()));
        tokio::fs::write(&backup, &content).await?;
        Ok(BeforeState {
            hash: Some(hash),
            backup: Some(backup),
        })
    }

    /// Record a completed mutation. Returns the record id.
    pub async fn record(&self, path: &Path, before: BeforeState) -> Result<String, UndoError> {
        let content = tokio::fs::read(path).await?;
        let record = UndoRecord {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.to_path_buf(),
            before_hash: before.hash,
            after_hash: hash_bytes(&content),
            backup: before.backup,
            recorded_at: Utc::now(),
        };
        let id = record.id.clone();
        self.records.write().await.push(record);
        Ok(id)
    }

    /// Paths mutated this session, most recent last, deduplicated.
    pub async fn touched_paths(&self) -> Vec<PathBuf> {
        let records = self.records.read().await;
        let mut seen = Vec::new();
        for record in records.iter() {
            if !seen.contains(&record.path) {
                seen.push(record.path.clone());
            }
        }
        seen
    }

    pub async fn latest_for(&self, path: &Path) -> Option<UndoRecord> {
        let records = self.records.read().await;
        records.iter().rev().find(|r| r.path == path).cloned()
    }

    /// Undo the most recent mutation of `path`. Verifies the current file
    /// hash against the recorded after-hash first; `force` overrides a
    /// mismatch explicitly.
    pub async fn undo(&self, path: &Path, force: bool) -> Result<UndoOutcome, UndoError> {
        let record = self
            .latest_for(path)
            .await
            .ok_or_else(|| UndoError::NoRecord(path.to_path_buf()))?;

        if !force {
            let actual = match tokio::fs::read(path).await {
                Ok(content) => hash_bytes(&content),
                Err(_) => String::from("<missing>"),
            };
            if actual != record.after_hash {
                return Err(UndoError::Conflict {
                    expected: record.after_hash.clone(),
                    actual,
                });
            }
        }

        let outcome = match &record.backup {
            Some(backup) => {
                if !backup.exists() {
                    return Err(UndoError::MissingBackup(backup.clone()));
                }
                tokio::fs::copy(backup, path).await?;
                UndoOutcome::Restored
            }
            None => {
                // Mutation created the file; undo removes it.
                tokio::fs::remove_file(path).await?;
                UndoOutcome::Deleted
            }
        };

        let mut records = self.records.write().await;
        if let Some(pos) = records.iter().rposition(|r| r.id == record.id) {
            records.remove(pos);
        }
        Ok(outcome)
    }
}

pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_in(dir: &Path) -> UndoLog {
        UndoLog::new(dir.join("backups"))
    }

    #[tokio::test]
    async fn test_undo_restores_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        tokio::fs::write(&file, "old").await.unwrap();

        let log = log_in(dir.path());
        let before = log.snapshot_before(&file).await.unwrap();
        tokio::fs::write(&file, "new").await.unwrap();
        log.record(&file, before).await.unwrap();

        let outcome = log.undo(&file, false).await.unwrap();
        assert_eq!(outcome, UndoOutcome::Restored);
        assert_eq!(tokio::fs::read_to_string(&file).await.unwrap(), "old");
    }

    #[tokio::test]
    async fn test_undo_of_created_file_deletes_it() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("new.txt");

        let log = log_in(dir.path());
        let before = log.snapshot_before(&file).await.unwrap();
        assert!(before.hash.is_none());
        tokio::fs::write(&file, "content").await.unwrap();
        log.record(&file, before).await.unwrap();

        let outcome = log.undo(&file, false).await.unwrap();
        assert_eq!(outcome, UndoOutcome::Deleted);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_undo_conflicts_when_file_changed_after_record() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        tokio::fs::write(&file, "old").await.unwrap();

        let log = log_in(dir.path());
        let before = log.snapshot_before(&file).await.unwrap();
        tokio::fs::write(&file, "new").await.unwrap();
        log.record(&file, before).await.unwrap();

        // Outside edit after the recorded mutation
        tokio::fs::write(&file, "tampered").await.unwrap();

        let err = log.undo(&file, false).await.unwrap_err();
        assert!(matches!(err, UndoError::Conflict { .. }));
        assert_eq!(tokio::fs::read_to_string(&file).await.unwrap(), "tampered");
    }

    #[tokio::test]
    async fn test_force_overrides_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        tokio::fs::write(&file, "old").await.unwrap();

        let log = log_in(dir.path());
        let before = log.snapshot_before(&file).await.unwrap();
        tokio::fs::write(&file, "new").await.unwrap();
        log.record(&file, before).await.unwrap();
        tokio::fs::write(&file, "tampered").await.unwrap();

        let outcome = log.undo(&file, true).await.unwrap();
        assert_eq!(outcome, UndoOutcome::Restored);
        assert_eq!(tokio::fs::read_to_string(&file).await.unwrap(), "old");
    }

    #[tokio::test]
    async fn test_no_record_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        let err = log.undo(&dir.path().join("x"), false).await.unwrap_err();
        assert!(matches!(err, UndoError::NoRecord(_)));
    }

    #[tokio::test]
    async fn test_touched_paths_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        let log = log_in(dir.path());

        for content in ["one", "two"] {
            let before = log.snapshot_before(&file).await.unwrap();
            tokio::fs::write(&file, content).await.unwrap();
            log.record(&file, before).await.unwrap();
        }
        assert_eq!(log.touched_paths().await.len(), 1);
    }
}
