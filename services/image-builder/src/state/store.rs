//! SQLite-based layer state store.
//!
//! Each layer, keyed by chain ID, owns a set of string properties and a set
//! of blob slots. The `primary` slot holds the layer's canonical blob; every
//! other slot is a variant keyed by compression or artifact kind.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use plfm_digest::Digest;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use crate::image::Descriptor;

/// Slot holding a layer's canonical blob.
pub const PRIMARY_SLOT: &str = "primary";

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),

    #[error("State store lock poisoned")]
    Poisoned,
}

/// Everything recorded for one layer in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct LayerUpdate {
    /// Set as the primary blob unless the layer already has one.
    pub primary: Option<Descriptor>,
    /// Variant slots to link, replacing any previous entry.
    pub links: Vec<(String, Descriptor)>,
    /// Properties to set.
    pub properties: Vec<(String, String)>,
}

/// SQLite layer store.
pub struct LayerStore {
    conn: Mutex<Connection>,
}

impl LayerStore {
    /// Open or create a layer store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StateStoreError> {
        self.conn.lock().map_err(|_| StateStoreError::Poisoned)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.lock()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS layer_properties (
                chain_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (chain_id, key)
            );

            CREATE TABLE IF NOT EXISTS layer_blobs (
                chain_id TEXT NOT NULL,
                slot TEXT NOT NULL,
                digest TEXT NOT NULL,
                media_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                annotations TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (chain_id, slot)
            );

            CREATE INDEX IF NOT EXISTS idx_layer_blobs_digest ON layer_blobs(digest);
            "#,
        )?;
        Ok(())
    }

    /// Get a layer property.
    pub fn get_property(
        &self,
        chain_id: &Digest,
        key: &str,
    ) -> Result<Option<String>, StateStoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT value FROM layer_properties WHERE chain_id = ?1 AND key = ?2")?;

        stmt.query_row(params![chain_id.to_string(), key], |row| row.get(0))
            .optional()
            .map_err(Into::into)
    }

    /// Set a layer property.
    pub fn set_property(
        &self,
        chain_id: &Digest,
        key: &str,
        value: &str,
    ) -> Result<(), StateStoreError> {
        let conn = self.lock()?;
        put_property(&conn, chain_id, key, value)
    }

    /// Get the blob linked in a slot.
    pub fn get_blob(
        &self,
        chain_id: &Digest,
        slot: &str,
    ) -> Result<Option<Descriptor>, StateStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT digest, media_type, size, annotations FROM layer_blobs
             WHERE chain_id = ?1 AND slot = ?2",
        )?;

        let raw = stmt
            .query_row(params![chain_id.to_string(), slot], RawBlob::from_row)
            .optional()?;
        raw.map(RawBlob::into_descriptor).transpose()
    }

    /// Link a blob into a variant slot, replacing the previous link.
    pub fn link_blob(
        &self,
        chain_id: &Digest,
        slot: &str,
        desc: &Descriptor,
    ) -> Result<(), StateStoreError> {
        let conn = self.lock()?;
        put_blob(&conn, chain_id, slot, desc)
    }

    /// Set the primary blob unless one is already recorded.
    ///
    /// Returns true if this call set it.
    pub fn set_primary_if_absent(
        &self,
        chain_id: &Digest,
        desc: &Descriptor,
    ) -> Result<bool, StateStoreError> {
        let conn = self.lock()?;
        put_primary_if_absent(&conn, chain_id, desc)
    }

    /// List every linked slot of a layer, ordered by slot.
    pub fn list_blobs(
        &self,
        chain_id: &Digest,
    ) -> Result<Vec<(String, Descriptor)>, StateStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT slot, digest, media_type, size, annotations FROM layer_blobs
             WHERE chain_id = ?1 ORDER BY slot",
        )?;

        let rows = stmt
            .query_map(params![chain_id.to_string()], |row| {
                let slot: String = row.get(0)?;
                Ok((
                    slot,
                    RawBlob {
                        digest: row.get(1)?,
                        media_type: row.get(2)?,
                        size: row.get(3)?,
                        annotations: row.get(4)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(slot, raw)| Ok((slot, raw.into_descriptor()?)))
            .collect()
    }

    /// Apply a [`LayerUpdate`] atomically.
    pub fn commit_layer(
        &self,
        chain_id: &Digest,
        update: &LayerUpdate,
    ) -> Result<(), StateStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if let Some(primary) = &update.primary {
            put_primary_if_absent(&tx, chain_id, primary)?;
        }
        for (slot, desc) in &update.links {
            put_blob(&tx, chain_id, slot, desc)?;
        }
        for (key, value) in &update.properties {
            put_property(&tx, chain_id, key, value)?;
        }

        tx.commit()?;

        debug!(
            chain_id = %chain_id,
            links = update.links.len(),
            properties = update.properties.len(),
            "Layer state committed"
        );
        Ok(())
    }

    /// Count layers with at least one recorded property.
    pub fn count_layers(&self) -> Result<i64, StateStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT COUNT(DISTINCT chain_id) FROM layer_properties")?;
        stmt.query_row([], |row| row.get(0)).map_err(Into::into)
    }
}

fn put_property(
    conn: &Connection,
    chain_id: &Digest,
    key: &str,
    value: &str,
) -> Result<(), StateStoreError> {
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        r#"
        INSERT INTO layer_properties (chain_id, key, value, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(chain_id, key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
        params![chain_id.to_string(), key, value, now],
    )?;
    Ok(())
}

fn put_blob(
    conn: &Connection,
    chain_id: &Digest,
    slot: &str,
    desc: &Descriptor,
) -> Result<(), StateStoreError> {
    let raw = RawBlob::from_descriptor(desc)?;
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        r#"
        INSERT INTO layer_blobs
            (chain_id, slot, digest, media_type, size, annotations, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(chain_id, slot) DO UPDATE SET
            digest = excluded.digest,
            media_type = excluded.media_type,
            size = excluded.size,
            annotations = excluded.annotations
        "#,
        params![
            chain_id.to_string(),
            slot,
            raw.digest,
            raw.media_type,
            raw.size,
            raw.annotations,
            now,
        ],
    )?;
    Ok(())
}

fn put_primary_if_absent(
    conn: &Connection,
    chain_id: &Digest,
    desc: &Descriptor,
) -> Result<bool, StateStoreError> {
    let raw = RawBlob::from_descriptor(desc)?;
    let now = chrono::Utc::now().timestamp();
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO layer_blobs
            (chain_id, slot, digest, media_type, size, annotations, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            chain_id.to_string(),
            PRIMARY_SLOT,
            raw.digest,
            raw.media_type,
            raw.size,
            raw.annotations,
            now,
        ],
    )?;
    Ok(inserted == 1)
}

/// Blob row as stored.
struct RawBlob {
    digest: String,
    media_type: String,
    size: i64,
    annotations: String,
}

impl RawBlob {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            digest: row.get(0)?,
            media_type: row.get(1)?,
            size: row.get(2)?,
            annotations: row.get(3)?,
        })
    }

    fn from_descriptor(desc: &Descriptor) -> Result<Self, StateStoreError> {
        let size = i64::try_from(desc.size)
            .map_err(|_| StateStoreError::Invalid(format!("blob size {} too large", desc.size)))?;
        Ok(Self {
            digest: desc.digest.to_string(),
            media_type: desc.media_type.clone(),
            size,
            annotations: serde_json::to_string(&desc.annotations)?,
        })
    }

    fn into_descriptor(self) -> Result<Descriptor, StateStoreError> {
        let digest = Digest::parse(&self.digest)
            .map_err(|e| StateStoreError::Invalid(format!("digest {:?}: {e}", self.digest)))?;
        let size = u64::try_from(self.size)
            .map_err(|_| StateStoreError::Invalid(format!("negative blob size {}", self.size)))?;
        let annotations: BTreeMap<String, String> = serde_json::from_str(&self.annotations)?;

        Ok(Descriptor {
            media_type: self.media_type,
            digest,
            size,
            annotations,
        })
    }
}
