use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use mend_config::{BackupConfig, resolve_path};
use mend_core::{content_hash, normalize_path};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::write_json_atomic;

pub const BACKUP_INDEX_FILE: &str = "index.json";
const DEFAULT_BACKUP_DIR: &str = "backups";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("backup index is unreadable: {0}")]
    Index(#[from] serde_json::Error),
    #[error("{0} is outside the workspace and cannot be backed up")]
    OutsideWorkspace(PathBuf),
    #[error("backup {id} copy of {file} does not match its recorded checksum")]
    Corrupt { id: String, file: String },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    /// Workspace-relative, forward-slash path.
    pub path: String,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub operation: String,
    pub files: Vec<BackupFile>,
    pub total_bytes: u64,
}

impl BackupRecord {
    pub fn covers(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.files.iter().any(|file| file.path == path)
    }
}

/// Result of `BackupManager::create`. `Disabled` stands in for a backup when
/// backups are switched off so callers can proceed without special cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupHandle {
    Created(String),
    Disabled,
}

impl BackupHandle {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Created(id) => Some(id),
            Self::Disabled => None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackupIndex {
    backups: Vec<BackupRecord>,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    workspace_root: PathBuf,
    backup_dir: PathBuf,
    enabled: bool,
    retention_days: u32,
    max_backups: usize,
}

impl BackupManager {
    pub fn new(workspace_root: impl AsRef<Path>, config: &BackupConfig) -> Self {
        let workspace_root = workspace_root.as_ref().to_path_buf();
        Self {
            backup_dir: resolve_path(&workspace_root, config.dir.as_deref(), DEFAULT_BACKUP_DIR),
            workspace_root,
            enabled: config.enabled,
            retention_days: config.retention_days,
            max_backups: config.max_backups,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Snapshots `files` under a fresh id. On any failure the partial backup
    /// directory is removed and the error returned.
    pub fn create(&self, files: &[PathBuf], operation: &str) -> Result<BackupHandle, BackupError> {
        self.create_at(files, operation, Utc::now())
    }

    fn create_at(
        &self,
        files: &[PathBuf],
        operation: &str,
        now: DateTime<Utc>,
    ) -> Result<BackupHandle, BackupError> {
        if !self.enabled {
            return Ok(BackupHandle::Disabled);
        }

        let mut index = self.load_index()?;
        let id = unique_id(&index, operation, now);
        let target = self.backup_dir.join(&id);

        match self.copy_into(&target, files) {
            Ok(copied) => {
                let record = BackupRecord {
                    total_bytes: copied.iter().map(|file| file.size).sum(),
                    id: id.clone(),
                    created_at: now,
                    operation: operation.to_owned(),
                    files: copied,
                };
                index.backups.push(record);
                if let Err(err) = self.save_index(&index) {
                    let _ = fs::remove_dir_all(&target);
                    return Err(err);
                }
                tracing::debug!(backup_id = %id, files = files.len(), "backup created");
                Ok(BackupHandle::Created(id))
            }
            Err(err) => {
                if let Err(cleanup_err) = fs::remove_dir_all(&target)
                    && cleanup_err.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(
                        backup_id = %id,
                        error = %cleanup_err,
                        "failed to remove partial backup"
                    );
                }
                Err(err)
            }
        }
    }

    fn copy_into(&self, target: &Path, files: &[PathBuf]) -> Result<Vec<BackupFile>, BackupError> {
        let mut seen = BTreeSet::new();
        let mut copied = Vec::with_capacity(files.len());
        for file in files {
            let relative = self.relative_path(file)?;
            let key = normalize_path(&relative.to_string_lossy());
            if !seen.insert(key.clone()) {
                continue;
            }

            let source = self.workspace_root.join(&relative);
            let destination = target.join(&relative);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }

            let content = fs::read(&source).map_err(io_error(&source))?;
            fs::copy(&source, &destination).map_err(io_error(&source))?;
            preserve_mtime(&source, &destination)?;

            copied.push(BackupFile {
                path: key,
                size: content.len() as u64,
                checksum: content_hash(&content),
            });
        }
        Ok(copied)
    }

    /// Restores every file of backup `id`. Unknown ids yield `false`.
    pub fn rollback(&self, id: &str) -> Result<bool, BackupError> {
        let Some(record) = self.get(id)? else {
            tracing::warn!(backup_id = %id, "rollback requested for unknown backup");
            return Ok(false);
        };

        let source_dir = self.backup_dir.join(&record.id);
        let mut verified = Vec::with_capacity(record.files.len());
        for file in &record.files {
            let stored = source_dir.join(&file.path);
            let content = fs::read(&stored).map_err(io_error(&stored))?;
            if content_hash(&content) != file.checksum {
                return Err(BackupError::Corrupt {
                    id: record.id.clone(),
                    file: file.path.clone(),
                });
            }
            verified.push((stored, self.workspace_root.join(&file.path)));
        }

        for (stored, destination) in verified {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            fs::copy(&stored, &destination).map_err(io_error(&destination))?;
            preserve_mtime(&stored, &destination)?;
        }

        tracing::info!(backup_id = %id, files = record.files.len(), "backup restored");
        Ok(true)
    }

    /// Newest first.
    pub fn list(&self) -> Result<Vec<BackupRecord>, BackupError> {
        let mut backups = self.load_index()?.backups;
        backups.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then(right.id.cmp(&left.id))
        });
        Ok(backups)
    }

    pub fn get(&self, id: &str) -> Result<Option<BackupRecord>, BackupError> {
        Ok(self
            .load_index()?
            .backups
            .into_iter()
            .find(|record| record.id == id))
    }

    pub fn delete(&self, id: &str) -> Result<bool, BackupError> {
        let mut index = self.load_index()?;
        let before = index.backups.len();
        index.backups.retain(|record| record.id != id);
        if index.backups.len() == before {
            return Ok(false);
        }

        let dir = self.backup_dir.join(id);
        if let Err(err) = fs::remove_dir_all(&dir)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            return Err(BackupError::Io {
                path: dir,
                source: err,
            });
        }
        self.save_index(&index)?;
        Ok(true)
    }

    /// Removes backups past the retention window together with the oldest
    /// ones beyond `max_backups`. Returns how many were removed.
    pub fn cleanup(&self) -> Result<usize, BackupError> {
        self.cleanup_at(Utc::now())
    }

    fn cleanup_at(&self, now: DateTime<Utc>) -> Result<usize, BackupError> {
        let mut backups = self.load_index()?.backups;
        backups.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then(left.id.cmp(&right.id))
        });

        let cutoff = now - Duration::days(i64::from(self.retention_days));
        let mut doomed: BTreeSet<String> = backups
            .iter()
            .filter(|record| record.created_at < cutoff)
            .map(|record| record.id.clone())
            .collect();
        let excess = backups.len().saturating_sub(self.max_backups);
        doomed.extend(backups.iter().take(excess).map(|record| record.id.clone()));

        let mut removed = 0;
        for id in &doomed {
            if self.delete(id)? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "old backups cleaned up");
        }
        Ok(removed)
    }

    fn relative_path(&self, file: &Path) -> Result<PathBuf, BackupError> {
        let relative = if file.is_absolute() {
            file.strip_prefix(&self.workspace_root)
                .map(Path::to_path_buf)
                .map_err(|_| BackupError::OutsideWorkspace(file.to_path_buf()))?
        } else {
            file.to_path_buf()
        };

        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(BackupError::OutsideWorkspace(file.to_path_buf()));
        }
        Ok(relative
            .components()
            .filter(|component| matches!(component, Component::Normal(_)))
            .collect())
    }

    fn index_path(&self) -> PathBuf {
        self.backup_dir.join(BACKUP_INDEX_FILE)
    }

    fn load_index(&self) -> Result<BackupIndex, BackupError> {
        let path = self.index_path();
        match fs::read(&path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BackupIndex::default()),
            Err(err) => Err(BackupError::Io { path, source: err }),
        }
    }

    fn save_index(&self, index: &BackupIndex) -> Result<(), BackupError> {
        let path = self.index_path();
        write_json_atomic(&path, index).map_err(io_error(&path))
    }
}

fn unique_id(index: &BackupIndex, operation: &str, now: DateTime<Utc>) -> String {
    let tag: String = operation
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    let base = format!("{}_{tag}", now.format("%Y%m%dT%H%M%S%.6f"));

    let taken = |candidate: &str| index.backups.iter().any(|record| record.id == candidate);
    if !taken(&base) {
        return base;
    }
    (1..)
        .map(|suffix| format!("{base}_{suffix}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or(base)
}

fn preserve_mtime(source: &Path, destination: &Path) -> Result<(), BackupError> {
    let modified = fs::metadata(source)
        .and_then(|metadata| metadata.modified())
        .map_err(io_error(source))?;
    File::options()
        .write(true)
        .open(destination)
        .and_then(|file| file.set_modified(modified))
        .map_err(io_error(destination))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn manager(root: &Path) -> BackupManager {
        BackupManager::new(root, &BackupConfig::default())
    }

    #[test]
    fn create_and_rollback_restore_exact_bytes() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("pkg")).expect("mkdir");
        fs::write(root.join("pkg/mod.py"), "x = 1\n").expect("write");

        let backups = manager(root);
        let handle = backups
            .create(&[PathBuf::from("pkg/mod.py")], "ai fix")
            .expect("create");
        let id = handle.id().expect("created").to_owned();
        assert!(id.ends_with("_ai_fix"));

        fs::write(root.join("pkg/mod.py"), "x = 2\n").expect("mutate");
        assert!(backups.rollback(&id).expect("rollback"));
        assert_eq!(
            fs::read_to_string(root.join("pkg/mod.py")).expect("read"),
            "x = 1\n"
        );

        let record = backups.get(&id).expect("get").expect("present");
        assert!(record.covers("./pkg/mod.py"));
        assert_eq!(record.total_bytes, 6);
    }

    #[test]
    fn disabled_manager_returns_sentinel() {
        let temp = tempdir().expect("tempdir");
        let config = BackupConfig {
            enabled: false,
            ..BackupConfig::default()
        };
        let backups = BackupManager::new(temp.path(), &config);

        let handle = backups
            .create(&[PathBuf::from("missing.py")], "ai")
            .expect("create");
        assert_eq!(handle, BackupHandle::Disabled);
        assert!(backups.list().expect("list").is_empty());
    }

    #[test]
    fn failed_create_leaves_nothing_behind() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("a.py"), "a\n").expect("write");

        let backups = manager(root);
        let result = backups.create(&[PathBuf::from("a.py"), PathBuf::from("gone.py")], "ai");
        assert!(matches!(result, Err(BackupError::Io { .. })));
        assert!(backups.list().expect("list").is_empty());

        let leftovers = fs::read_dir(backups.backup_dir())
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn unknown_rollback_is_false() {
        let temp = tempdir().expect("tempdir");
        assert!(!manager(temp.path()).rollback("nope").expect("rollback"));
    }

    #[test]
    fn paths_outside_the_workspace_are_rejected() {
        let temp = tempdir().expect("tempdir");
        let result = manager(temp.path()).create(&[PathBuf::from("../escape.py")], "ai");
        assert!(matches!(result, Err(BackupError::OutsideWorkspace(_))));
    }

    #[test]
    fn cleanup_unions_expired_and_excess() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("a.py"), "a\n").expect("write");
        let config = BackupConfig {
            retention_days: 7,
            max_backups: 2,
            ..BackupConfig::default()
        };
        let backups = BackupManager::new(root, &config);

        let now = Utc::now();
        let files = [PathBuf::from("a.py")];
        backups
            .create_at(&files, "old", now - Duration::days(10))
            .expect("old");
        backups
            .create_at(&files, "mid", now - Duration::days(3))
            .expect("mid");
        backups
            .create_at(&files, "recent", now - Duration::days(2))
            .expect("recent");
        backups.create_at(&files, "new", now).expect("new");

        assert_eq!(backups.cleanup_at(now).expect("cleanup"), 2);
        let remaining: Vec<String> = backups
            .list()
            .expect("list")
            .into_iter()
            .map(|record| record.operation)
            .collect();
        assert_eq!(remaining, vec!["new".to_owned(), "recent".to_owned()]);
    }

    #[test]
    fn tampered_copy_refuses_to_restore() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("a.py"), "a\n").expect("write");
        let backups = manager(root);
        let handle = backups.create(&[PathBuf::from("a.py")], "ai").expect("create");
        let id = handle.id().expect("id");

        fs::write(backups.backup_dir().join(id).join("a.py"), "evil\n").expect("tamper");
        fs::write(root.join("a.py"), "b\n").expect("mutate");

        assert!(matches!(backups.rollback(id), Err(BackupError::Corrupt { .. })));
        assert_eq!(fs::read_to_string(root.join("a.py")).expect("read"), "b\n");
    }
}
