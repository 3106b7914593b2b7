use std::path::Path;

use rusqlite::{types::Value, Row};
use serde::Serialize;
use tracing::info;
use zeroize::Zeroizing;

use super::secret::{generate_secret, hash_secret};
use super::table::{EntryId, Filter, KeyedTable, Medium, Record, RecordKind};
use crate::error::StoreResult;

/// An administrator-issued access token. Only the digest is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token_hash: String,
    pub enabled: bool,
}

impl RecordKind for AccessToken {
    const TABLE: &'static str = "access_tokens";
    const COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("token_hash", "TEXT NOT NULL"),
        ("enabled", "INTEGER NOT NULL"),
    ];

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.token_hash.clone()),
            Value::Integer(self.enabled as i64),
        ]
    }

    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            token_hash: row.get(offset)?,
            enabled: row.get(offset + 1)?,
        })
    }
}

pub type AccessTokenRecord = Record<AccessToken>;

/// What `access-token list` shows; never includes the digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessTokenSummary {
    pub entry_id: EntryId,
    pub created_at: i64,
    pub enabled: bool,
}

/// A freshly created entry together with its plaintext secret. This is the
/// only place the plaintext ever exists server-side.
#[derive(Debug)]
pub struct IssuedSecret {
    pub entry_id: EntryId,
    pub created_at: i64,
    pub secret: Zeroizing<String>,
}

/// Persistent table of access tokens gating container requests.
pub struct AccessTokenStore {
    table: KeyedTable<AccessToken>,
}

impl AccessTokenStore {
    /// Open (or create) the token table at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let table = KeyedTable::open(Medium::File(path.to_path_buf()))?;
        Ok(Self { table })
    }

    /// Create a new token. The plaintext is returned exactly once.
    pub fn add_entry(&self, disabled: bool) -> StoreResult<IssuedSecret> {
        let secret = generate_secret();
        let (entry_id, created_at) = self.table.insert(&AccessToken {
            token_hash: hash_secret(&secret),
            enabled: !disabled,
        })?;
        info!(entry_id, enabled = !disabled, "access token created");
        Ok(IssuedSecret {
            entry_id,
            created_at,
            secret,
        })
    }

    pub fn get_entry(&self, entry_id: EntryId) -> StoreResult<Option<AccessTokenRecord>> {
        self.table.get(entry_id)
    }

    pub fn list_entries(&self) -> StoreResult<Vec<AccessTokenSummary>> {
        Ok(self
            .table
            .list()?
            .into_iter()
            .map(|record| AccessTokenSummary {
                entry_id: record.entry_id,
                created_at: record.created_at,
                enabled: record.value.enabled,
            })
            .collect())
    }

    pub fn enable_entry(&self, entry_id: EntryId) -> StoreResult<()> {
        self.set_enabled(entry_id, true)
    }

    pub fn disable_entry(&self, entry_id: EntryId) -> StoreResult<()> {
        self.set_enabled(entry_id, false)
    }

    pub fn delete_entry(&self, entry_id: EntryId) -> StoreResult<()> {
        self.table.remove(entry_id)?;
        info!(entry_id, "access token deleted");
        Ok(())
    }

    /// Resolve a plaintext token to its entry. Disabled tokens never match.
    pub fn authenticate(&self, token: &str) -> StoreResult<Option<EntryId>> {
        let filter = Filter::new()
            .eq("token_hash", hash_secret(token))
            .eq("enabled", true);
        Ok(self.table.find(&filter)?.map(|record| record.entry_id))
    }

    pub fn count(&self) -> StoreResult<u64> {
        self.table.count()
    }

    /// Release the underlying file. A second close fails with `Closed`.
    pub fn close(&self) -> StoreResult<()> {
        self.table.close()
    }

    fn set_enabled(&self, entry_id: EntryId, enabled: bool) -> StoreResult<()> {
        self.table
            .update(entry_id, &[("enabled", Value::Integer(enabled as i64))])?;
        info!(entry_id, enabled, "access token updated");
        Ok(())
    }
}
