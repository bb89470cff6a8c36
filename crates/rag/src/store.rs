use std::fs;
use std::path::{Path, PathBuf};

use bytemuck::{cast_slice, pod_collect_to_vec};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use finops_core::ContentHash;

use crate::error::{RagError, Result};
use crate::index::{Index, IndexEntry, IndexHeader};

/// SQLite-backed persistence for a single [`Index`].
///
/// Saves replace the previous index inside one transaction, so readers see
/// either the old index or the new one in full.
#[derive(Debug, Clone)]
pub struct IndexStore {
    path: PathBuf,
}

impl IndexStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                RagError::Persistence(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let store = Self { path };
        store.init()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS index_header (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                dataset_hash TEXT NOT NULL,
                built_at TEXT NOT NULL,
                dimensions INTEGER NOT NULL,
                entry_count INTEGER NOT NULL,
                provider TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS index_entries (
                position INTEGER PRIMARY KEY,
                record_id TEXT NOT NULL UNIQUE,
                content_hash TEXT NOT NULL,
                vector BLOB NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn save(&self, index: &Index) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM index_entries", [])?;
        tx.execute("DELETE FROM index_header", [])?;
        let header = index.header();
        tx.execute(
            "INSERT INTO index_header (id, dataset_hash, built_at, dimensions, entry_count, provider)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                header.dataset_hash,
                header.built_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                header.dimensions as i64,
                header.entry_count as i64,
                header.provider,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO index_entries (position, record_id, content_hash, vector)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (position, entry) in index.entries().iter().enumerate() {
                let blob: &[u8] = cast_slice(&entry.vector);
                stmt.execute(params![
                    position as i64,
                    entry.record_id,
                    entry.content_hash.as_str(),
                    blob
                ])?;
            }
        }
        tx.commit()?;
        info!(
            path = %self.path.display(),
            entries = index.len(),
            dataset_hash = %index.dataset_hash(),
            "index saved"
        );
        Ok(())
    }

    /// Returns `None` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<Index>> {
        let conn = self.connection()?;
        let header = conn
            .query_row(
                "SELECT dataset_hash, built_at, dimensions, entry_count, provider
                 FROM index_header WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((dataset_hash, built_at, dimensions, entry_count, provider)) = header else {
            debug!(path = %self.path.display(), "no stored index");
            return Ok(None);
        };
        let built_at = DateTime::parse_from_rfc3339(&built_at)
            .map_err(|e| RagError::Persistence(format!("invalid built_at {built_at:?}: {e}")))?
            .with_timezone(&Utc);
        let header = IndexHeader {
            dataset_hash,
            built_at,
            dimensions: dimensions as usize,
            entry_count: entry_count as usize,
            provider,
        };

        let mut stmt = conn.prepare(
            "SELECT record_id, content_hash, vector FROM index_entries ORDER BY position",
        )?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::with_capacity(header.entry_count);
        while let Some(row) = rows.next()? {
            let record_id: String = row.get(0)?;
            let content_hash: String = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            if blob.len() % std::mem::size_of::<f32>() != 0 {
                return Err(RagError::Persistence(format!(
                    "vector for {record_id} has {} bytes",
                    blob.len()
                )));
            }
            entries.push(IndexEntry {
                record_id,
                vector: pod_collect_to_vec::<u8, f32>(&blob),
                content_hash: ContentHash::from_hex(content_hash),
            });
        }
        let index = Index::from_parts(header, entries)?;
        debug!(path = %self.path.display(), entries = index.len(), "index loaded");
        Ok(Some(index))
    }
}
