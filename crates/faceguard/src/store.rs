//! Identity persistence.
//!
//! SQLite is the preferred backend. When the database cannot be opened the
//! store falls back to a single JSON file holding a [`StorageData`] envelope,
//! replaced atomically on every write. Mutations on either backend are
//! serialized through one per-store write queue.

use faceguard_core::{Descriptor, DescriptorError, Identity, StorageData, DESCRIPTOR_DIM};
use rusqlite::OptionalExtension;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;

const DESCRIPTOR_BYTE_LEN: usize = DESCRIPTOR_DIM * 4;

/// File name of the JSON fallback store inside the data directory.
pub const JSON_STORE_FILE: &str = "faceguard-users.json";
/// File name of the SQLite database inside the data directory.
pub const DB_FILE: &str = "faceguard.db";
const MEMORY_DB: &str = ":memory:";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("store file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid identity {label:?}: {reason}")]
    InvalidIdentity { label: String, reason: String },
    #[error("invalid stored descriptors: {0}")]
    Descriptor(#[from] DescriptorError),
}

/// Which backend a store ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    JsonFile,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => f.write_str("sqlite"),
            Self::JsonFile => f.write_str("json-file"),
        }
    }
}

/// Where the store keeps its data.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite database path, `:memory:` for an in-memory database, or `None`
    /// to go straight to the JSON file backend.
    pub db_path: Option<PathBuf>,
    /// Directory holding the JSON fallback file.
    pub data_dir: PathBuf,
}

impl StoreConfig {
    /// SQLite database and JSON fallback both under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            db_path: Some(data_dir.join(DB_FILE)),
            data_dir,
        }
    }

    /// In-memory SQLite database. Nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            db_path: Some(PathBuf::from(MEMORY_DB)),
            data_dir: std::env::temp_dir(),
        }
    }

    /// JSON file backend only.
    pub fn json_file(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: None,
            data_dir: data_dir.into(),
        }
    }
}

/// Cloneable handle to the persisted identity gallery.
#[derive(Clone)]
pub struct IdentityStore {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Backend,
    location: PathBuf,
    write_queue: Mutex<()>,
}

enum Backend {
    Sqlite(Connection),
    JsonFile(JsonFile),
}

impl IdentityStore {
    /// Open the preferred backend, falling back to the JSON file.
    ///
    /// Fails only when the fallback directory itself cannot be created.
    pub async fn initialize(config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(db_path) = &config.db_path {
            match open_sqlite(db_path).await {
                Ok(conn) => {
                    tracing::info!(path = %db_path.display(), "identity store opened (sqlite)");
                    return Ok(Self::with_backend(Backend::Sqlite(conn), db_path.clone()));
                }
                Err(e) => tracing::warn!(
                    path = %db_path.display(),
                    error = %e,
                    "sqlite unavailable; falling back to JSON file store"
                ),
            }
        }

        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", config.data_dir.display())))?;
        let path = config.data_dir.join(JSON_STORE_FILE);
        tracing::info!(path = %path.display(), "identity store opened (json file)");
        Ok(Self::with_backend(
            Backend::JsonFile(JsonFile { path: path.clone() }),
            path,
        ))
    }

    fn with_backend(backend: Backend, location: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                location,
                write_queue: Mutex::new(()),
            }),
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self.inner.backend {
            Backend::Sqlite(_) => BackendKind::Sqlite,
            Backend::JsonFile(_) => BackendKind::JsonFile,
        }
    }

    /// Database or JSON file path backing this store.
    pub fn location(&self) -> &Path {
        &self.inner.location
    }

    /// Insert or replace an identity by label.
    pub async fn save_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        validate_identity(identity)?;
        let _queued = self.inner.write_queue.lock().await;

        match &self.inner.backend {
            Backend::Sqlite(conn) => {
                let label = identity.label.clone();
                let blob = encode_descriptors(&identity.descriptors);
                let created_at = identity.created_at;
                conn.call(move |conn| {
                    conn.execute(
                        "INSERT INTO identities (label, descriptors, created_at)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(label) DO UPDATE SET
                             descriptors = excluded.descriptors,
                             created_at = excluded.created_at",
                        rusqlite::params![label, blob, created_at],
                    )?;
                    Ok(())
                })
                .await?;
            }
            Backend::JsonFile(file) => {
                let mut users = file.read_all().await?;
                match users.iter_mut().find(|u| u.label == identity.label) {
                    Some(existing) => *existing = identity.clone(),
                    None => users.push(identity.clone()),
                }
                file.write_all(users).await?;
            }
        }

        tracing::debug!(label = %identity.label, samples = identity.sample_count(), "identity saved");
        Ok(())
    }

    /// Append one descriptor to `label`, creating the identity if needed.
    ///
    /// `created_at` is only used when the identity is new. Returns the
    /// identity as persisted.
    pub async fn enroll_sample(
        &self,
        label: &str,
        created_at: i64,
        descriptor: Descriptor,
    ) -> Result<Identity, StoreError> {
        let label = label.trim().to_string();
        if label.is_empty() {
            return Err(StoreError::InvalidIdentity {
                label,
                reason: "label is empty".into(),
            });
        }
        let _queued = self.inner.write_queue.lock().await;

        let identity = match &self.inner.backend {
            Backend::Sqlite(conn) => {
                let sample = descriptor.to_bytes();
                let row_label = label.clone();
                let (blob, created_at) = conn
                    .call(move |conn| {
                        let tx = conn.transaction()?;
                        let existing: Option<(Vec<u8>, i64)> = tx
                            .query_row(
                                "SELECT descriptors, created_at FROM identities WHERE label = ?1",
                                [&row_label],
                                |row| Ok((row.get(0)?, row.get(1)?)),
                            )
                            .optional()?;
                        let (mut blob, created_at) = existing.unwrap_or((Vec::new(), created_at));
                        blob.extend_from_slice(&sample);
                        tx.execute(
                            "INSERT INTO identities (label, descriptors, created_at)
                             VALUES (?1, ?2, ?3)
                             ON CONFLICT(label) DO UPDATE SET descriptors = excluded.descriptors",
                            rusqlite::params![row_label, blob, created_at],
                        )?;
                        tx.commit()?;
                        Ok((blob, created_at))
                    })
                    .await?;
                Identity {
                    label,
                    descriptors: decode_descriptors(&blob)?,
                    created_at,
                }
            }
            Backend::JsonFile(file) => {
                let mut users = file.read_all().await?;
                let identity = match users.iter_mut().find(|u| u.label == label) {
                    Some(existing) => {
                        existing.descriptors.push(descriptor);
                        existing.clone()
                    }
                    None => {
                        let mut identity = Identity::new(label, created_at);
                        identity.descriptors.push(descriptor);
                        users.push(identity.clone());
                        identity
                    }
                };
                file.write_all(users).await?;
                identity
            }
        };

        tracing::info!(
            label = %identity.label,
            samples = identity.sample_count(),
            "descriptor enrolled"
        );
        Ok(identity)
    }

    /// Every stored identity. Order is not guaranteed.
    pub async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        match &self.inner.backend {
            Backend::Sqlite(conn) => {
                let rows: Vec<(String, Vec<u8>, i64)> = conn
                    .call(|conn| {
                        let mut stmt =
                            conn.prepare("SELECT label, descriptors, created_at FROM identities")?;
                        let rows = stmt.query_map([], |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, Vec<u8>>(1)?,
                                row.get::<_, i64>(2)?,
                            ))
                        })?;
                        Ok(rows.collect::<Result<Vec<_>, _>>()?)
                    })
                    .await?;

                rows.into_iter()
                    .map(|(label, blob, created_at)| {
                        Ok(Identity {
                            label,
                            descriptors: decode_descriptors(&blob)?,
                            created_at,
                        })
                    })
                    .collect()
            }
            Backend::JsonFile(file) => file.read_all().await,
        }
    }

    /// Remove `label`. Returns false when it was not stored.
    pub async fn delete_identity(&self, label: &str) -> Result<bool, StoreError> {
        let _queued = self.inner.write_queue.lock().await;

        let removed = match &self.inner.backend {
            Backend::Sqlite(conn) => {
                let label = label.to_string();
                conn.call(move |conn| {
                    let affected =
                        conn.execute("DELETE FROM identities WHERE label = ?1", [&label])?;
                    Ok(affected > 0)
                })
                .await?
            }
            Backend::JsonFile(file) => {
                let mut users = file.read_all().await?;
                let before = users.len();
                users.retain(|u| u.label != label);
                if users.len() == before {
                    false
                } else {
                    file.write_all(users).await?;
                    true
                }
            }
        };

        tracing::debug!(label, removed, "delete identity");
        Ok(removed)
    }

    /// Remove every identity.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let _queued = self.inner.write_queue.lock().await;

        match &self.inner.backend {
            Backend::Sqlite(conn) => {
                conn.call(|conn| {
                    conn.execute("DELETE FROM identities", [])?;
                    Ok(())
                })
                .await?;
            }
            Backend::JsonFile(file) => file.write_all(Vec::new()).await?,
        }

        tracing::info!("identity store cleared");
        Ok(())
    }

    /// Current contents wrapped in the export envelope.
    pub async fn export_snapshot(&self) -> Result<StorageData, StoreError> {
        let mut users = self.list_identities().await?;
        users.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(StorageData::new(users))
    }

    /// Replace all content with `data`.
    ///
    /// Every entry is validated before anything is written; the replacement
    /// itself is one transaction (or one atomic file write), so a failure
    /// leaves the previous contents in place. Returns the number of
    /// identities imported.
    pub async fn import_snapshot(&self, data: &StorageData) -> Result<usize, StoreError> {
        for identity in &data.users {
            validate_identity(identity)?;
        }
        let _queued = self.inner.write_queue.lock().await;

        match &self.inner.backend {
            Backend::Sqlite(conn) => {
                let rows: Vec<(String, Vec<u8>, i64)> = data
                    .users
                    .iter()
                    .map(|u| (u.label.clone(), encode_descriptors(&u.descriptors), u.created_at))
                    .collect();
                conn.call(move |conn| {
                    let tx = conn.transaction()?;
                    tx.execute("DELETE FROM identities", [])?;
                    {
                        let mut stmt = tx.prepare(
                            "INSERT OR REPLACE INTO identities (label, descriptors, created_at)
                             VALUES (?1, ?2, ?3)",
                        )?;
                        for (label, blob, created_at) in &rows {
                            stmt.execute(rusqlite::params![label, blob, created_at])?;
                        }
                    }
                    tx.commit()?;
                    Ok(())
                })
                .await?;
            }
            Backend::JsonFile(file) => {
                let mut users: Vec<Identity> = Vec::with_capacity(data.users.len());
                for identity in &data.users {
                    match users.iter_mut().find(|u| u.label == identity.label) {
                        Some(existing) => *existing = identity.clone(),
                        None => users.push(identity.clone()),
                    }
                }
                file.write_all(users).await?;
            }
        }

        let imported = self.list_identities().await?.len();
        tracing::info!(imported, "identity snapshot imported");
        Ok(imported)
    }
}

async fn open_sqlite(db_path: &Path) -> Result<Connection, StoreError> {
    let conn = if db_path == Path::new(MEMORY_DB) {
        Connection::open_in_memory().await?
    } else {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Connection::open(db_path).await?
    };

    conn.call(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS identities (
                 label TEXT PRIMARY KEY,
                 descriptors BLOB NOT NULL,
                 created_at INTEGER NOT NULL
             );",
        )?;
        Ok(())
    })
    .await?;

    Ok(conn)
}

/// JSON file backend: the whole gallery in one envelope.
struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    async fn read_all(&self) -> Result<Vec<Identity>, StoreError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let data: StorageData = serde_json::from_str(&text)?;
        Ok(data.users)
    }

    /// Write to a sibling temp file, then rename over the store file.
    async fn write_all(&self, users: Vec<Identity>) -> Result<(), StoreError> {
        let json = serde_json::to_vec(&StorageData::new(users))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn validate_identity(identity: &Identity) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidIdentity {
        label: identity.label.clone(),
        reason: reason.to_string(),
    };
    if identity.label.trim().is_empty() {
        return Err(invalid("label is empty"));
    }
    if identity.descriptors.is_empty() {
        return Err(invalid("no descriptors"));
    }
    Ok(())
}

fn encode_descriptors(descriptors: &[Descriptor]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(descriptors.len() * DESCRIPTOR_BYTE_LEN);
    for descriptor in descriptors {
        blob.extend_from_slice(&descriptor.to_bytes());
    }
    blob
}

fn decode_descriptors(blob: &[u8]) -> Result<Vec<Descriptor>, StoreError> {
    if blob.len() % DESCRIPTOR_BYTE_LEN != 0 {
        return Err(DescriptorError::InvalidBlob(blob.len()).into());
    }
    blob.chunks_exact(DESCRIPTOR_BYTE_LEN)
        .map(|chunk| Descriptor::from_bytes(chunk).map_err(StoreError::from))
        .collect()
}
