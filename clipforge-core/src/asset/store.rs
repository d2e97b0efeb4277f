use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use super::error::{StoreError, StoreResult};
use super::models::Asset;

const ASSET_SCHEMA: &str = include_str!("../../../sql/assets.sql");

/// Persistence seam used by the orchestrator. Single-record writes are
/// atomic; there are no multi-record transactions.
pub trait AssetStore: Send + Sync {
    fn get(&self, id: &str) -> StoreResult<Asset>;
    /// Upserts the record. Last write wins.
    fn put(&self, asset: &Asset) -> StoreResult<Asset>;
    fn remove(&self, asset: &Asset) -> StoreResult<()>;
    fn list(&self, limit: usize) -> StoreResult<Vec<Asset>>;
    /// Atomically flips `processing` from false to true and clears
    /// `processing_success`. Fails with `Conflict` when another operation
    /// already holds the flag.
    fn begin_processing(&self, id: &str, operation: &str) -> StoreResult<Asset>;
    /// Rewrites every record still marked `processing` as failed.
    fn recover_stale(&self) -> StoreResult<usize>;
}

#[derive(Debug, Clone)]
pub struct SqliteAssetStoreBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
}

impl Default for SqliteAssetStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
        }
    }
}

impl SqliteAssetStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteAssetStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteAssetStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteAssetStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteAssetStore {
    pub fn builder() -> SqliteAssetStoreBuilder {
        SqliteAssetStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteAssetStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(ASSET_SCHEMA)?;
        Ok(())
    }

    fn fetch(&self, conn: &Connection, id: &str) -> StoreResult<Option<Asset>> {
        let asset = conn
            .query_row("SELECT * FROM assets WHERE id = ?1", [id], Asset::from_row)
            .optional()?;
        Ok(asset)
    }
}

impl AssetStore for SqliteAssetStore {
    fn get(&self, id: &str) -> StoreResult<Asset> {
        let conn = self.open()?;
        self.fetch(&conn, id)?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    fn put(&self, asset: &Asset) -> StoreResult<Asset> {
        let conn = self.open()?;
        let mut stored = asset.clone();
        stored.updated_at = Utc::now();
        conn.execute(
            "INSERT INTO assets (
                id, logical_name, format, storage_path, processing, processing_success,
                last_operation, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                logical_name = excluded.logical_name,
                format = excluded.format,
                storage_path = excluded.storage_path,
                processing = excluded.processing,
                processing_success = excluded.processing_success,
                last_operation = excluded.last_operation,
                updated_at = excluded.updated_at",
            params![
                &stored.id,
                &stored.logical_name,
                &stored.format,
                stored.storage_path.to_string_lossy().to_string(),
                stored.processing,
                stored.processing_success,
                &stored.last_operation,
                stored.created_at,
                stored.updated_at,
            ],
        )?;
        Ok(stored)
    }

    fn remove(&self, asset: &Asset) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute("DELETE FROM assets WHERE id = ?1", [&asset.id])?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                id: asset.id.clone(),
            });
        }
        Ok(())
    }

    fn list(&self, limit: usize) -> StoreResult<Vec<Asset>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM assets ORDER BY updated_at DESC, id ASC LIMIT ?1")?;
        let rows = stmt
            .query_map([limit as i64], Asset::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn begin_processing(&self, id: &str, operation: &str) -> StoreResult<Asset> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let affected = tx.execute(
            "UPDATE assets
             SET processing = 1, processing_success = NULL, last_operation = ?2, updated_at = ?3
             WHERE id = ?1 AND processing = 0",
            params![id, operation, Utc::now()],
        )?;
        let current = self.fetch(&tx, id)?;
        tx.commit()?;
        match (affected, current) {
            (_, None) => Err(StoreError::NotFound { id: id.to_string() }),
            (0, Some(_)) => Err(StoreError::Conflict { id: id.to_string() }),
            (_, Some(asset)) => Ok(asset),
        }
    }

    fn recover_stale(&self) -> StoreResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE assets SET processing = 0, processing_success = 0, updated_at = ?1
             WHERE processing = 1",
            [Utc::now()],
        )?;
        Ok(affected)
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}
