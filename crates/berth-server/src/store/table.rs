//! Typed SQLite table shared by both credential stores.
//!
//! A [`KeyedTable`] holds records of one [`RecordKind`]. Every record gets a
//! server-assigned `entry_id` (`AUTOINCREMENT`, so deleted IDs are never
//! handed out again) and a `created_at` timestamp. The table lives either in
//! a file or purely in memory; both media share the exact same semantics.
//!
//! All access goes through a single mutex around the connection. Writes run
//! inside an `IMMEDIATE` transaction which is rolled back when any step
//! fails, so a failed call leaves the table exactly as it was.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{
    params_from_iter, types::Value, Connection, OptionalExtension, Row, TransactionBehavior,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

pub type EntryId = i64;

/// How long a file-backed table waits for a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A stored record: common columns plus the kind-specific value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record<V> {
    pub entry_id: EntryId,
    pub created_at: i64,
    pub value: V,
}

/// A value type that can be stored in a [`KeyedTable`].
pub trait RecordKind: Sized {
    /// SQL table name.
    const TABLE: &'static str;
    /// `(name, declaration)` of every value column, in row order.
    const COLUMNS: &'static [(&'static str, &'static str)];

    /// Column values in the order of [`RecordKind::COLUMNS`].
    fn to_values(&self) -> Vec<Value>;

    /// Decode the value columns, which start at `offset` in `row`.
    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self>;
}

/// Where a table keeps its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Medium {
    File(PathBuf),
    Memory,
}

/// Equality terms evaluated together in one `WHERE` clause, joined with `AND`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    terms: Vec<(&'static str, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.terms.push((column, value.into()));
        self
    }

    fn clause(&self) -> String {
        if self.terms.is_empty() {
            return "1".to_owned();
        }
        self.terms
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn params(&self) -> impl Iterator<Item = &Value> {
        self.terms.iter().map(|(_, value)| value)
    }
}

/// A keyed-record table over one record kind and one medium.
pub struct KeyedTable<V> {
    conn: Mutex<Option<Connection>>,
    _kind: PhantomData<fn() -> V>,
}

impl<V: RecordKind> KeyedTable<V> {
    /// Open (or create) the table on `medium`.
    pub fn open(medium: Medium) -> StoreResult<Self> {
        let conn = match medium {
            Medium::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let conn = Connection::open(&path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                let mode: String =
                    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                debug!(table = V::TABLE, path = %path.display(), journal_mode = %mode, "opened table file");
                conn
            }
            Medium::Memory => Connection::open_in_memory()?,
        };

        let columns = V::COLUMNS
            .iter()
            .map(|(name, decl)| format!("{name} {decl}"))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                entry_id INTEGER PRIMARY KEY AUTOINCREMENT, \
                created_at INTEGER NOT NULL, \
                {columns})",
            V::TABLE
        ))?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            _kind: PhantomData,
        })
    }

    /// Insert a record, returning its entry ID and creation timestamp.
    pub fn insert(&self, value: &V) -> StoreResult<(EntryId, i64)> {
        self.write(|conn| insert_row(conn, value))
    }

    /// Insert a record unless one matching `conflict` already exists. The
    /// check and the insert happen in the same transaction.
    pub fn insert_unique(
        &self,
        value: &V,
        conflict: &Filter,
        what: impl FnOnce() -> String,
    ) -> StoreResult<(EntryId, i64)> {
        self.write(|conn| {
            if count_matching::<V>(conn, conflict)? > 0 {
                return Err(StoreError::Duplicate { what: what() });
            }
            insert_row(conn, value)
        })
    }

    pub fn get(&self, entry_id: EntryId) -> StoreResult<Option<Record<V>>> {
        self.read(|conn| {
            let sql = format!("SELECT {} FROM {} WHERE entry_id = ?1", select_list::<V>(), V::TABLE);
            Ok(conn.query_row(&sql, [entry_id], map_record::<V>).optional()?)
        })
    }

    /// First record (lowest entry ID) matching every term of `filter`.
    pub fn find(&self, filter: &Filter) -> StoreResult<Option<Record<V>>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {} FROM {} WHERE {} ORDER BY entry_id LIMIT 1",
                select_list::<V>(),
                V::TABLE,
                filter.clause()
            );
            Ok(conn
                .query_row(&sql, params_from_iter(filter.params()), map_record::<V>)
                .optional()?)
        })
    }

    /// Every record, ordered by entry ID.
    pub fn list(&self) -> StoreResult<Vec<Record<V>>> {
        self.read(|conn| {
            let sql = format!("SELECT {} FROM {} ORDER BY entry_id", select_list::<V>(), V::TABLE);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], map_record::<V>)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn count(&self) -> StoreResult<u64> {
        self.read(|conn| count_matching::<V>(conn, &Filter::new()))
    }

    /// Set the given value columns of one record.
    pub fn update(&self, entry_id: EntryId, fields: &[(&'static str, Value)]) -> StoreResult<()> {
        self.write(|conn| {
            let assignments = fields
                .iter()
                .enumerate()
                .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE {} SET {assignments} WHERE entry_id = ?{}",
                V::TABLE,
                fields.len() + 1
            );
            let params = fields
                .iter()
                .map(|(_, value)| value.clone())
                .chain(std::iter::once(Value::Integer(entry_id)));
            match conn.execute(&sql, params_from_iter(params))? {
                0 => Err(StoreError::NotFound { entry_id }),
                _ => Ok(()),
            }
        })
    }

    /// Overwrite every value column of one record.
    pub fn replace(&self, entry_id: EntryId, value: &V) -> StoreResult<()> {
        let fields: Vec<_> = V::COLUMNS
            .iter()
            .map(|(name, _)| *name)
            .zip(value.to_values())
            .collect();
        self.update(entry_id, &fields)
    }

    pub fn remove(&self, entry_id: EntryId) -> StoreResult<()> {
        self.write(|conn| {
            let sql = format!("DELETE FROM {} WHERE entry_id = ?1", V::TABLE);
            match conn.execute(&sql, [entry_id])? {
                0 => Err(StoreError::NotFound { entry_id }),
                _ => Ok(()),
            }
        })
    }

    /// Release the connection. Closing twice is an error.
    pub fn close(&self) -> StoreResult<()> {
        let conn = self.conn.lock().take().ok_or(StoreError::Closed)?;
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        debug!(table = V::TABLE, "closed table");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    fn read<R>(&self, f: impl FnOnce(&Connection) -> StoreResult<R>) -> StoreResult<R> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    }

    fn write<R>(&self, f: impl FnOnce(&Connection) -> StoreResult<R>) -> StoreResult<R> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(out) => {
                tx.commit()?;
                Ok(out)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(table = V::TABLE, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn select_list<V: RecordKind>() -> String {
    let mut columns = vec!["entry_id", "created_at"];
    columns.extend(V::COLUMNS.iter().map(|(name, _)| *name));
    columns.join(", ")
}

fn map_record<V: RecordKind>(row: &Row<'_>) -> rusqlite::Result<Record<V>> {
    Ok(Record {
        entry_id: row.get(0)?,
        created_at: row.get(1)?,
        value: V::from_row(row, 2)?,
    })
}

fn insert_row<V: RecordKind>(conn: &Connection, value: &V) -> StoreResult<(EntryId, i64)> {
    let created_at = now();
    let names: Vec<&str> = V::COLUMNS.iter().map(|(name, _)| *name).collect();
    let placeholders = (2..=names.len() + 1)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} (created_at, {}) VALUES (?1, {placeholders})",
        V::TABLE,
        names.join(", ")
    );
    let params = std::iter::once(Value::Integer(created_at)).chain(value.to_values());
    conn.execute(&sql, params_from_iter(params))?;
    Ok((conn.last_insert_rowid(), created_at))
}

fn count_matching<V: RecordKind>(conn: &Connection, filter: &Filter) -> StoreResult<u64> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", V::TABLE, filter.clause());
    let count: i64 = conn.query_row(&sql, params_from_iter(filter.params()), |row| row.get(0))?;
    Ok(count as u64)
}
