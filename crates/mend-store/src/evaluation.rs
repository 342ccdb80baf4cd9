use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mend_config::mend_dir;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::StoreError;

pub const EVALUATION_SQLITE_FILE: &str = "evaluations.sqlite";
pub const EVALUATION_JSONL_FILE: &str = "evaluations.jsonl";

/// One stage-3 batch: what was asked, what came back, and how the error set
/// moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub run_id: String,
    pub batch_index: usize,
    pub file: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub prompt: String,
    pub response: String,
    pub before: Vec<(usize, String)>,
    pub after: Vec<(usize, String)>,
    pub fixed: Vec<(usize, String)>,
    pub remaining: Vec<(usize, String)>,
    pub introduced: Vec<(usize, String)>,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

pub trait EvaluationStore: Send + Sync {
    fn record(&self, record: &EvaluationRecord) -> Result<(), StoreError>;
    fn list_by_model(&self, model: &str) -> Result<Vec<EvaluationRecord>, StoreError>;
    fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<EvaluationRecord>, StoreError>;
}

pub struct SqliteEvaluationStore {
    conn: Mutex<Connection>,
    mirror: Option<JsonlEvaluationStore>,
}

impl SqliteEvaluationStore {
    /// Opens `.mend/evaluations.sqlite`, mirroring records to
    /// `.mend/evaluations.jsonl` when `legacy_jsonl` is set.
    pub fn open(workspace_root: impl AsRef<Path>, legacy_jsonl: bool) -> Result<Self, StoreError> {
        let dir = mend_dir(workspace_root);
        let mirror = legacy_jsonl.then(|| JsonlEvaluationStore::new(dir.join(EVALUATION_JSONL_FILE)));
        Self::open_at(&dir.join(EVALUATION_SQLITE_FILE), mirror)
    }

    pub fn open_at(path: &Path, mirror: Option<JsonlEvaluationStore>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            mirror,
        })
    }

    fn query(&self, sql: &str, param: rusqlite::types::Value) -> Result<Vec<EvaluationRecord>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|err| StoreError::LockPoisoned(err.to_string()))?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![param], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }
}

impl EvaluationStore for SqliteEvaluationStore {
    fn record(&self, record: &EvaluationRecord) -> Result<(), StoreError> {
        let body = serde_json::to_string(record)?;
        {
            let conn = self
                .conn
                .lock()
                .map_err(|err| StoreError::LockPoisoned(err.to_string()))?;
            conn.execute(
                r#"
                INSERT INTO evaluations (
                    run_id, batch_index, file, model, success, created_at, record_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    record.run_id,
                    record.batch_index as i64,
                    record.file,
                    record.model,
                    record.success,
                    record.created_at.timestamp_millis(),
                    body,
                ],
            )?;
        }

        if let Some(mirror) = &self.mirror
            && let Err(err) = mirror.record(record)
        {
            tracing::warn!(error = %err, "failed to mirror evaluation record to jsonl");
        }
        Ok(())
    }

    fn list_by_model(&self, model: &str) -> Result<Vec<EvaluationRecord>, StoreError> {
        self.query(
            "SELECT record_json FROM evaluations WHERE model = ?1 ORDER BY created_at, id",
            rusqlite::types::Value::Text(model.to_owned()),
        )
    }

    fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<EvaluationRecord>, StoreError> {
        self.query(
            "SELECT record_json FROM evaluations WHERE created_at >= ?1 ORDER BY created_at, id",
            rusqlite::types::Value::Integer(since.timestamp_millis()),
        )
    }
}

/// Append-only JSON-lines log, one record per line.
#[derive(Debug, Clone)]
pub struct JsonlEvaluationStore {
    path: PathBuf,
}

impl JsonlEvaluationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<EvaluationRecord>, StoreError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %err,
                    "skipping malformed evaluation record"
                ),
            }
        }
        Ok(records)
    }
}

impl EvaluationStore for JsonlEvaluationStore {
    fn record(&self, record: &EvaluationRecord) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn list_by_model(&self, model: &str) -> Result<Vec<EvaluationRecord>, StoreError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|record| record.model == model)
            .collect())
    }

    fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<EvaluationRecord>, StoreError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|record| record.created_at >= since)
            .collect())
    }
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS evaluations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            batch_index INTEGER NOT NULL,
            file TEXT NOT NULL,
            model TEXT NOT NULL,
            success INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            record_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS evaluations_model_idx ON evaluations (model);
        CREATE INDEX IF NOT EXISTS evaluations_created_idx ON evaluations (created_at);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    use super::*;

    fn record(model: &str, created_at: DateTime<Utc>) -> EvaluationRecord {
        EvaluationRecord {
            run_id: "run-1".to_owned(),
            batch_index: 0,
            file: "a.py".to_owned(),
            model: model.to_owned(),
            temperature: 0.1,
            top_p: 0.95,
            max_tokens: 4096,
            prompt: "fix".to_owned(),
            response: "1: x = 1".to_owned(),
            before: vec![(1, "F401".to_owned())],
            after: Vec::new(),
            fixed: vec![(1, "F401".to_owned())],
            remaining: Vec::new(),
            introduced: Vec::new(),
            success: true,
            created_at,
        }
    }

    #[test]
    fn sqlite_store_filters_and_mirrors() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteEvaluationStore::open(temp.path(), true).expect("open");
        let now = Utc::now();

        store
            .record(&record("gemini-2.0-flash", now - ChronoDuration::days(3)))
            .expect("record old");
        store.record(&record("mock", now)).expect("record new");

        assert_eq!(store.list_by_model("mock").expect("by model").len(), 1);
        let recent = store
            .list_since(now - ChronoDuration::days(1))
            .expect("since");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].model, "mock");

        let mirror = JsonlEvaluationStore::new(temp.path().join(".mend").join(EVALUATION_JSONL_FILE));
        assert_eq!(mirror.list_since(now - ChronoDuration::days(30)).expect("mirror").len(), 2);
    }

    #[test]
    fn sqlite_store_without_mirror_writes_no_jsonl() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteEvaluationStore::open(temp.path(), false).expect("open");
        store.record(&record("mock", Utc::now())).expect("record");

        assert!(!temp.path().join(".mend").join(EVALUATION_JSONL_FILE).exists());
    }

    #[test]
    fn jsonl_store_skips_malformed_lines() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("evals.jsonl");
        let store = JsonlEvaluationStore::new(&path);
        store.record(&record("mock", Utc::now())).expect("record");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"{not json}\n").expect("append");
        store.record(&record("mock", Utc::now())).expect("record");

        assert_eq!(store.list_by_model("mock").expect("list").len(), 2);
    }
}
