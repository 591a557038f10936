//! Statement execution against the unlocked handle.
//!
//! A [`QueryExecutor`] is only ever handed out on the command queue's worker,
//! so holding one means no other operation can touch the handle meanwhile.

use crate::session::SessionCore;
use crate::{VaultError, VaultResult};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

/// Query surface available inside queued work.
pub struct QueryExecutor<'a> {
    core: &'a SessionCore,
}

impl<'a> QueryExecutor<'a> {
    pub(crate) fn new(core: &'a SessionCore) -> Self {
        Self { core }
    }

    // ==========================================
    // Statements
    // ==========================================

    /// Run one or more statements separated by `;`.
    pub fn try_execute(&self, sql: &str) -> VaultResult<()> {
        self.run(sql, |conn| Ok(conn.execute_batch(sql)?))
    }

    /// Like [`Self::try_execute`], but a failure is a programming error.
    ///
    /// # Panics
    ///
    /// Panics if the statement fails.
    pub fn execute(&self, sql: &str) {
        if let Err(e) = self.try_execute(sql) {
            panic!("statement failed: {e}: {sql}");
        }
    }

    /// Run a single statement with positional parameters; returns rows changed.
    pub fn try_execute_with(&self, sql: &str, params: &[Value]) -> VaultResult<usize> {
        check_params(params)?;
        self.run(sql, |conn| {
            let mut stmt = conn.prepare(sql)?;
            Ok(stmt.execute(params_from_iter(params.iter()))?)
        })
    }

    /// # Panics
    ///
    /// Panics if the statement fails.
    pub fn execute_with(&self, sql: &str, params: &[Value]) -> usize {
        match self.try_execute_with(sql, params) {
            Ok(changed) => changed,
            Err(e) => panic!("statement failed: {e}: {sql}"),
        }
    }

    /// Collect every row as a vector of column values.
    pub fn rows_for(&self, sql: &str, params: &[Value]) -> VaultResult<Vec<Vec<Value>>> {
        check_params(params)?;
        self.run(sql, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(columns);
                for i in 0..columns {
                    values.push(row.get::<_, Value>(i)?);
                }
                out.push(values);
            }
            Ok(out)
        })
    }

    /// Stream rows into `f`; returns how many rows were visited.
    ///
    /// An error from `f` stops the iteration and is returned as-is. Lifecycle
    /// operations attempted from inside `f` fail with [`VaultError::Busy`].
    pub fn for_each_row<F>(&self, sql: &str, params: &[Value], mut f: F) -> VaultResult<usize>
    where
        F: FnMut(&Row<'_>) -> VaultResult<()>,
    {
        check_params(params)?;
        let mut visited = 0;
        let mut callback_error = None;
        let result = self.run(sql, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            while let Some(row) = rows.next()? {
                visited += 1;
                if let Err(e) = f(row) {
                    callback_error = Some(e);
                    break;
                }
            }
            Ok(())
        });
        match callback_error {
            Some(e) => Err(e),
            None => result.map(|()| visited),
        }
    }

    /// First column of the first row, or `None` when there are no rows.
    pub fn scalar(&self, sql: &str, params: &[Value]) -> VaultResult<Option<Value>> {
        check_params(params)?;
        self.run(sql, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns = stmt.column_count();
            // Statements without result columns still run
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            match rows.next()? {
                Some(row) if columns > 0 => Ok(Some(row.get::<_, Value>(0)?)),
                _ => Ok(None),
            }
        })
    }

    /// Text form of [`Self::scalar`]. Numbers are rendered, NULL and blobs give `None`.
    pub fn scalar_text(&self, sql: &str, params: &[Value]) -> VaultResult<Option<String>> {
        Ok(match self.scalar(sql, params)? {
            Some(Value::Text(text)) => Some(text),
            Some(Value::Integer(n)) => Some(n.to_string()),
            Some(Value::Real(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    /// Blob form of [`Self::scalar`]. Text comes back as its UTF-8 bytes.
    pub fn blob(&self, sql: &str, params: &[Value]) -> VaultResult<Option<Vec<u8>>> {
        Ok(match self.scalar(sql, params)? {
            Some(Value::Blob(bytes)) => Some(bytes),
            Some(Value::Text(text)) => Some(text.into_bytes()),
            _ => None,
        })
    }

    /// Integer result of a counting query; zero when it yields no row.
    pub fn count_for_sql(&self, sql: &str) -> VaultResult<i64> {
        match self.scalar(sql, &[])? {
            Some(Value::Integer(n)) => Ok(n),
            None | Some(Value::Null) => Ok(0),
            Some(other) => Err(VaultError::command_failed(format!(
                "count query returned a non-integer value: {other:?}"
            ))),
        }
    }

    pub fn count_for_table(&self, table: &str) -> VaultResult<i64> {
        self.count_for_sql(&format!("SELECT count(*) FROM {}", quote_identifier(table)))
    }

    // ==========================================
    // Transactions
    // ==========================================

    pub fn in_transaction(&self) -> bool {
        self.core.in_transaction.get()
    }

    /// Start a transaction. Does nothing if one is already open.
    pub fn begin_transaction(&self) -> VaultResult<()> {
        if self.core.in_transaction.get() {
            debug!("Transaction already open; begin ignored");
            return Ok(());
        }
        self.run("BEGIN", |conn| Ok(conn.execute_batch("BEGIN")?))?;
        self.core.in_transaction.set(true);
        Ok(())
    }

    /// Commit the open transaction. Does nothing if none is open.
    pub fn commit_transaction(&self) -> VaultResult<()> {
        if !self.core.in_transaction.get() {
            return Ok(());
        }
        let result = self.run("COMMIT", |conn| {
            let committed = conn.execute_batch("COMMIT");
            // A failed COMMIT can still end the transaction
            Ok((committed, conn.is_autocommit()))
        });
        match result {
            Ok((Ok(()), _)) => {
                self.core.in_transaction.set(false);
                Ok(())
            }
            Ok((Err(e), ended)) => {
                if ended {
                    self.core.in_transaction.set(false);
                }
                Err(self.report("COMMIT", e.into()))
            }
            Err(e) => Err(e),
        }
    }

    /// Roll back the open transaction. Does nothing if none is open.
    pub fn rollback_transaction(&self) -> VaultResult<()> {
        if !self.core.in_transaction.get() {
            return Ok(());
        }
        // The engine may already have rolled back on its own
        self.core.in_transaction.set(false);
        self.run("ROLLBACK", |conn| {
            if conn.is_autocommit() {
                return Ok(());
            }
            Ok(conn.execute_batch("ROLLBACK")?)
        })
    }

    /// Run `body` in a transaction: commit on `Ok`, roll back on `Err` or panic.
    ///
    /// Inside an already open transaction the body simply joins it.
    pub fn transaction<T, F>(&self, body: F) -> VaultResult<T>
    where
        F: FnOnce(&QueryExecutor<'_>) -> VaultResult<T>,
    {
        if self.core.in_transaction.get() {
            return body(self);
        }

        self.begin_transaction()?;
        match panic::catch_unwind(AssertUnwindSafe(|| body(self))) {
            Ok(Ok(value)) => match self.commit_transaction() {
                Ok(()) => Ok(value),
                Err(e) => {
                    if let Err(rollback) = self.rollback_transaction() {
                        warn!(error = %rollback, "Rollback after failed commit failed");
                    }
                    Err(e)
                }
            },
            Ok(Err(e)) => {
                if let Err(rollback) = self.rollback_transaction() {
                    warn!(error = %rollback, "Rollback after failed transaction body failed");
                }
                Err(e)
            }
            Err(payload) => {
                if let Err(rollback) = self.rollback_transaction() {
                    warn!(error = %rollback, "Rollback after panic failed");
                }
                panic::resume_unwind(payload)
            }
        }
    }

    // ==========================================
    // Schema metadata
    // ==========================================

    /// The file's `user_version`.
    pub fn schema_version(&self) -> VaultResult<i64> {
        self.core.schema_version()
    }

    pub fn set_schema_version(&self, version: i64) -> VaultResult<()> {
        self.core.set_schema_version(version)
    }

    fn run<T>(&self, sql: &str, f: impl FnOnce(&Connection) -> VaultResult<T>) -> VaultResult<T> {
        self.core
            .with_connection(f)
            .map_err(|e| self.report(sql, e))
    }

    /// Tell the observer about engine failures; other errors pass through quietly.
    fn report(&self, sql: &str, err: VaultError) -> VaultError {
        if let VaultError::StatementFailed { code, message } = &err {
            warn!(%code, error = %message, sql, "Statement failed");
            self.core.observer.did_encounter_database_error(message);
        }
        err
    }
}

/// Only NULL is rejected; it must be written as a literal `NULL` in SQL.
fn check_params(params: &[Value]) -> VaultResult<()> {
    match params.iter().position(|p| matches!(p, Value::Null)) {
        Some(index) => Err(VaultError::InvalidParameter {
            index,
            reason: "NULL cannot be bound; use a NULL literal".to_string(),
        }),
        None => Ok(()),
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_params_are_rejected_with_index() {
        let params = vec![Value::Integer(1), Value::Null];
        match check_params(&params) {
            Err(VaultError::InvalidParameter { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(check_params(&[Value::Text("a".into()), Value::Blob(vec![1])]).is_ok());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("items"), "\"items\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
