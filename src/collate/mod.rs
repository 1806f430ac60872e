// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Collated result tables
//!
//! A collated table is a comma-delimited file shared by every subject. It has
//! exactly one header row, written by whichever subject appends first, and is
//! only ever appended to afterwards.
//!
//! Each append runs inside two critical sections: an in-process mutex per
//! table (for concurrent subjects in one run) and a lock file (for separate
//! mriflow processes). Both are released when the append returns, whether it
//! succeeded or not.

mod lock;

pub use lock::TableLock;

use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::{MriflowError, MriflowResult};

/// Default time to wait for another process's table lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// One row of a collated table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollatedRow {
    fields: Vec<String>,
}

impl CollatedRow {
    /// A row whose first column is the subject label
    pub fn new<I, T>(label: &str, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        let mut fields = vec![label.to_string()];
        fields.extend(values.into_iter().map(|v| v.to_string()));
        Self { fields }
    }

    /// Row built from raw fields
    pub fn from_fields(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn write_to(&self, out: &mut String) {
        out.push_str(&self.fields.join(","));
        out.push('\n');
    }
}

/// What an append did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The table did not exist and was created with a header
    pub created: bool,
    /// Data rows written
    pub rows: usize,
}

/// Appends result rows to shared tables
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    /// In-process mutex per table path
    tables: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
    lock_timeout: Duration,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(HashMap::new())),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Wait at most `timeout` for another process's lock
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Append `rows` to `table`, creating it with `columns` as header.
    ///
    /// Every row is validated before anything is written, so a mismatching
    /// row leaves the table untouched.
    pub async fn append(
        &self,
        table: &Path,
        columns: &[String],
        rows: &[CollatedRow],
    ) -> MriflowResult<AppendOutcome> {
        validate_fields(table, columns.iter())?;
        for row in rows {
            if row.len() != columns.len() {
                return Err(MriflowError::SchemaMismatch {
                    table: table.to_path_buf(),
                    reason: format!("row has {} fields, schema has {}", row.len(), columns.len()),
                });
            }
            validate_fields(table, row.fields().iter())?;
        }

        if let Some(parent) = table.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| MriflowError::directory(parent, e))?;
        }

        let table_mutex = self.table_mutex(table);
        let _in_process = table_mutex.lock().await;
        let _cross_process = TableLock::acquire(table, self.lock_timeout).await?;

        let outcome = write_locked(table, columns, rows)?;
        info!(
            table = %table.display(),
            rows = outcome.rows,
            created = outcome.created,
            "collated results"
        );
        Ok(outcome)
    }

    fn table_mutex(&self, table: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tables.entry(table.to_path_buf()).or_default().clone()
    }
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_fields<'a>(table: &Path, fields: impl Iterator<Item = &'a String>) -> MriflowResult<()> {
    for field in fields {
        if field.contains(|c| matches!(c, ',' | '\n' | '\r')) {
            return Err(MriflowError::InvalidField {
                table: table.to_path_buf(),
                value: field.clone(),
            });
        }
    }
    Ok(())
}

/// Parse the header row of an existing table
pub fn read_header(table: &Path) -> MriflowResult<Option<Vec<String>>> {
    let content = match fs::read_to_string(table) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(MriflowError::FileReadError {
                path: table.to_path_buf(),
                error: e.to_string(),
            })
        }
    };

    Ok(content
        .lines()
        .next()
        .filter(|line| !line.is_empty())
        .map(|line| line.split(',').map(str::to_string).collect()))
}

/// Must only be called while holding both table locks
fn write_locked(table: &Path, columns: &[String], rows: &[CollatedRow]) -> MriflowResult<AppendOutcome> {
    let write_err = |e: std::io::Error| MriflowError::FileWriteError {
        path: table.to_path_buf(),
        error: e.to_string(),
    };

    let mut body = String::new();
    for row in rows {
        row.write_to(&mut body);
    }

    match read_header(table)? {
        None => {
            let mut content = columns.join(",");
            content.push('\n');
            content.push_str(&body);

            // Header and rows become visible together
            let staging = table.with_extension("csv.partial");
            fs::write(&staging, content).map_err(write_err)?;
            fs::rename(&staging, table).map_err(write_err)?;

            debug!(table = %table.display(), "created collated table");
            Ok(AppendOutcome {
                created: true,
                rows: rows.len(),
            })
        }
        Some(header) => {
            if header.len() != columns.len() {
                return Err(MriflowError::SchemaMismatch {
                    table: table.to_path_buf(),
                    reason: format!(
                        "row has {} fields, header has {}",
                        columns.len(),
                        header.len()
                    ),
                });
            }
            if header != columns {
                return Err(MriflowError::SchemaMismatch {
                    table: table.to_path_buf(),
                    reason: format!("header [{}] differs from [{}]", header.join(","), columns.join(",")),
                });
            }
            if rows.is_empty() {
                return Ok(AppendOutcome {
                    created: false,
                    rows: 0,
                });
            }

            let mut file = OpenOptions::new()
                .read(true)
                .append(true)
                .open(table)
                .map_err(write_err)?;

            // Repair a missing trailing newline so rows never merge
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).map_err(write_err)?;
            file.read_exact(&mut last).map_err(write_err)?;
            if last[0] != b'\n' {
                body.insert(0, '\n');
            }

            file.write_all(body.as_bytes()).map_err(write_err)?;
            file.sync_data().map_err(write_err)?;

            Ok(AppendOutcome {
                created: false,
                rows: rows.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_first_append_writes_header() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("predicted_age_collated.csv");
        let aggregator = ResultAggregator::new();

        let outcome = aggregator
            .append(
                &table,
                &columns(&["ID", "Predicted_Age"]),
                &[CollatedRow::new("sub-01", [71.5])],
            )
            .await
            .unwrap();

        assert!(outcome.created);
        assert_eq!(
            fs::read_to_string(&table).unwrap(),
            "ID,Predicted_Age\nsub-01,71.5\n"
        );
        assert!(!TableLock::path_for(&table).exists());
    }

    #[tokio::test]
    async fn test_second_append_keeps_single_header() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("t.csv");
        let aggregator = ResultAggregator::new();
        let cols = columns(&["ID", "Predicted_Age"]);

        aggregator
            .append(&table, &cols, &[CollatedRow::new("sub-01", [70])])
            .await
            .unwrap();
        let outcome = aggregator
            .append(&table, &cols, &[CollatedRow::new("sub-02", [80])])
            .await
            .unwrap();

        assert!(!outcome.created);
        assert_eq!(
            fs::read_to_string(&table).unwrap(),
            "ID,Predicted_Age\nsub-01,70\nsub-02,80\n"
        );
    }

    #[tokio::test]
    async fn test_wider_row_is_schema_mismatch_and_table_unchanged() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("WMHstats_collated.csv");
        let four = columns(&["ID", "a", "b", "c"]);
        let five = columns(&["ID", "a", "b", "c", "d"]);
        let aggregator = ResultAggregator::new();

        aggregator
            .append(&table, &four, &[CollatedRow::new("sub-01", [1, 2, 3])])
            .await
            .unwrap();
        let before = fs::read_to_string(&table).unwrap();

        let err = aggregator
            .append(&table, &five, &[CollatedRow::new("sub-02", [1, 2, 3, 4])])
            .await
            .unwrap_err();

        assert!(matches!(err, MriflowError::SchemaMismatch { .. }));
        assert_eq!(fs::read_to_string(&table).unwrap(), before);
        assert!(!TableLock::path_for(&table).exists());
    }

    #[tokio::test]
    async fn test_row_wider_than_columns_rejected_before_io() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("t.csv");

        let err = ResultAggregator::new()
            .append(
                &table,
                &columns(&["ID", "a"]),
                &[CollatedRow::new("sub-01", [1, 2])],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MriflowError::SchemaMismatch { .. }));
        assert!(!table.exists());
    }

    #[tokio::test]
    async fn test_renamed_column_is_schema_mismatch() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("t.csv");
        fs::write(&table, "ID,Age\nsub-01,70\n").unwrap();

        let err = ResultAggregator::new()
            .append(
                &table,
                &columns(&["ID", "Predicted_Age"]),
                &[CollatedRow::new("sub-02", [80])],
            )
            .await
            .unwrap_err();

        assert!(err.is_schema_violation());
    }

    #[tokio::test]
    async fn test_field_with_comma_rejected() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("t.csv");

        let err = ResultAggregator::new()
            .append(
                &table,
                &columns(&["ID", "note"]),
                &[CollatedRow::new("sub-01", ["a,b"])],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MriflowError::InvalidField { .. }));
    }

    #[tokio::test]
    async fn test_missing_trailing_newline_repaired() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("t.csv");
        fs::write(&table, "ID,x\nsub-01,1").unwrap();

        ResultAggregator::new()
            .append(&table, &columns(&["ID", "x"]), &[CollatedRow::new("sub-02", [2])])
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(&table).unwrap(), "ID,x\nsub-01,1\nsub-02,2\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_do_not_interleave() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("t.csv");
        let aggregator = ResultAggregator::new();
        let cols = columns(&["ID", "probability_threshold_used", "WMH_number"]);
        let subjects = 32;

        let mut handles = Vec::new();
        for i in 0..subjects {
            let aggregator = aggregator.clone();
            let table = table.clone();
            let cols = cols.clone();
            handles.push(tokio::spawn(async move {
                let label = format!("sub-{:03}", i);
                aggregator
                    .append(&table, &cols, &[CollatedRow::new(&label, ["0.9", "12"])])
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let content = fs::read_to_string(&table).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), subjects + 1);
        assert_eq!(lines[0], "ID,probability_threshold_used,WMH_number");
        assert_eq!(lines.iter().filter(|l| l.starts_with("ID,")).count(), 1);
        for line in &lines[1..] {
            assert_eq!(line.split(',').count(), 3, "corrupt line {:?}", line);
            assert!(line.starts_with("sub-"));
        }
    }
}
