//! Result handlers driven by the simple query state machine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::Result;
use crate::protocol::backend::query::{CommandComplete, DataRow, RowDescription};
use crate::row::{Column, Row};

/// Handler for simple query results (text format).
///
/// Callback patterns by statement type:
/// - SELECT with rows: `result_start` → `row*` → `result_end`
/// - SELECT with 0 rows: `result_start` → `result_end`
/// - INSERT/UPDATE/DELETE: `result_end` only (with affected row count)
/// - empty query string: `empty_query`
///
/// For multi-statement queries like `"SELECT 1; UPDATE foo SET x=1"`:
/// ```text
/// result_start → row* → result_end   // SELECT 1
/// result_end                          // UPDATE
/// ```
pub trait TextHandler {
    /// Called when a result set begins.
    fn result_start(&mut self, cols: &RowDescription<'_>) -> Result<()> {
        let _ = cols;
        Ok(())
    }

    /// Called for each data row.
    fn row(&mut self, cols: &RowDescription<'_>, row: DataRow<'_>) -> Result<()>;

    /// Called when a statement completes.
    fn result_end(&mut self, complete: CommandComplete<'_>) -> Result<()> {
        let _ = complete;
        Ok(())
    }

    /// Called when the query string was empty.
    fn empty_query(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Result of the last statement of a query.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Columns, if the statement returned a result set
    pub columns: Option<Arc<[Column]>>,
    /// Buffered rows
    pub rows: Vec<Row>,
    /// Command tag of the statement (e.g. `SELECT 3`)
    pub command_tag: Option<String>,
    /// Rows affected or returned, parsed from the command tag
    pub rows_affected: Option<u64>,
}

/// Where an asynchronous query delivers its result.
///
/// The cursor holds the only strong reference. The connection keeps a
/// `Weak` while the query runs, so a result whose cursor is gone is
/// dropped on arrival.
pub(crate) type ResultSlot = Arc<Mutex<Option<QueryResult>>>;

/// Lock a result slot. A poisoned slot is still a valid `Option`.
pub(crate) fn lock_slot(
    slot: &Mutex<Option<QueryResult>>,
) -> MutexGuard<'_, Option<QueryResult>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handler that buffers the result of the last statement.
///
/// Every statement of a multi-statement query replaces what the previous
/// one produced, so `"select 'a'; select 'b'"` leaves only the `b` rows.
#[derive(Debug, Default)]
pub struct ResultCollector {
    result: QueryResult,
    in_result_set: bool,
}

impl ResultCollector {
    /// Create a new collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the collected result.
    pub fn into_result(self) -> QueryResult {
        self.result
    }
}

impl TextHandler for ResultCollector {
    fn result_start(&mut self, cols: &RowDescription<'_>) -> Result<()> {
        let columns: Arc<[Column]> = cols.fields().iter().map(Column::from).collect();
        self.result = QueryResult {
            columns: Some(columns),
            ..QueryResult::default()
        };
        self.in_result_set = true;
        Ok(())
    }

    fn row(&mut self, _cols: &RowDescription<'_>, row: DataRow<'_>) -> Result<()> {
        if let Some(columns) = &self.result.columns {
            let row = Row::from_data_row(columns, row);
            self.result.rows.push(row);
        }
        Ok(())
    }

    fn result_end(&mut self, complete: CommandComplete<'_>) -> Result<()> {
        if !self.in_result_set {
            // A statement without a result set still replaces the previous one.
            self.result = QueryResult::default();
        }
        self.in_result_set = false;
        self.result.command_tag = Some(complete.tag.to_string());
        self.result.rows_affected = complete.rows_affected();
        Ok(())
    }

    fn empty_query(&mut self) -> Result<()> {
        self.result = QueryResult::default();
        self.in_result_set = false;
        Ok(())
    }
}
