use rusqlite::{types::Value, Row};
use serde::Serialize;
use tracing::{debug, info};

use super::access_tokens::IssuedSecret;
use super::secret::{generate_secret, hash_secret};
use super::table::{EntryId, Filter, KeyedTable, Medium, Record, RecordKind};
use crate::error::StoreResult;

/// Binds a live container to the secret handed to its client.
/// Both fields are SHA-256 digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredential {
    pub container_hash: String,
    pub secret_hash: String,
}

impl RecordKind for SessionCredential {
    const TABLE: &'static str = "session_credentials";
    const COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("container_hash", "TEXT NOT NULL"),
        ("secret_hash", "TEXT NOT NULL"),
    ];

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.container_hash.clone()),
            Value::Text(self.secret_hash.clone()),
        ]
    }

    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            container_hash: row.get(offset)?,
            secret_hash: row.get(offset + 1)?,
        })
    }
}

pub type SessionRecord = Record<SessionCredential>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub entry_id: EntryId,
    pub created_at: i64,
}

/// In-memory session credentials, alive for the lifetime of the server
/// process. Dropping or closing the store forgets every session.
pub struct SessionStore {
    table: KeyedTable<SessionCredential>,
}

impl SessionStore {
    pub fn new() -> StoreResult<Self> {
        let table = KeyedTable::open(Medium::Memory)?;
        Ok(Self { table })
    }

    /// Mint a session for `container_id`. Fails with `Duplicate` if the
    /// container already has one.
    pub fn add_entry(&self, container_id: &str) -> StoreResult<IssuedSecret> {
        let secret = generate_secret();
        let credential = SessionCredential {
            container_hash: hash_secret(container_id),
            secret_hash: hash_secret(&secret),
        };
        let conflict = Filter::new().eq("container_hash", credential.container_hash.clone());
        let (entry_id, created_at) = self.table.insert_unique(&credential, &conflict, || {
            format!("container '{container_id}'")
        })?;
        info!(entry_id, "session created");
        Ok(IssuedSecret {
            entry_id,
            created_at,
            secret,
        })
    }

    /// Authenticate a client: both the container identity and the secret
    /// must match the same record.
    pub fn get_entry_id(&self, container_id: &str, secret: &str) -> StoreResult<Option<EntryId>> {
        let filter = Filter::new()
            .eq("container_hash", hash_secret(container_id))
            .eq("secret_hash", hash_secret(secret));
        Ok(self.table.find(&filter)?.map(|record| record.entry_id))
    }

    /// Look up the live session of a container, if any.
    pub fn get_container_entry_id(&self, container_id: &str) -> StoreResult<Option<EntryId>> {
        let filter = Filter::new().eq("container_hash", hash_secret(container_id));
        Ok(self.table.find(&filter)?.map(|record| record.entry_id))
    }

    pub fn get_entry(&self, entry_id: EntryId) -> StoreResult<Option<SessionRecord>> {
        self.table.get(entry_id)
    }

    pub fn list_entries(&self) -> StoreResult<Vec<SessionSummary>> {
        Ok(self
            .table
            .list()?
            .into_iter()
            .map(|record| SessionSummary {
                entry_id: record.entry_id,
                created_at: record.created_at,
            })
            .collect())
    }

    /// Rebind an entry to `container_id` and `secret`.
    pub fn update_entry(&self, entry_id: EntryId, container_id: &str, secret: &str) -> StoreResult<()> {
        self.table.replace(
            entry_id,
            &SessionCredential {
                container_hash: hash_secret(container_id),
                secret_hash: hash_secret(secret),
            },
        )?;
        debug!(entry_id, "session updated");
        Ok(())
    }

    pub fn delete_entry(&self, entry_id: EntryId) -> StoreResult<()> {
        self.table.remove(entry_id)?;
        info!(entry_id, "session deleted");
        Ok(())
    }

    pub fn count(&self) -> StoreResult<u64> {
        self.table.count()
    }

    pub fn close(&self) -> StoreResult<()> {
        self.table.close()
    }
}
