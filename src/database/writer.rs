//! Single-writer access to the state database.
//!
//! Concurrent direct connections to SQLite produce "database is locked"
//! errors under write load, so every mutation is funnelled through one
//! dedicated thread owning the connection. Callers hand it boxed tasks and
//! await the result over a oneshot channel. Readers bypass the worker with
//! short-lived connections of their own.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::database::store::{
    self, ArtifactEntry, FolderId, KnownFileId, KnownFileRef, QueueKind, RecordingFolder,
    SkipReason, Snapshot, StoreError,
};
use crate::database::{initialise_database, open_connection, DatabaseError};

type WriteTask = Box<dyn FnOnce(&mut Connection) + Send>;

/// Cloneable handle to the state store. Mutations run on the writer
/// thread; reads run on fresh connections via the blocking pool.
#[derive(Clone)]
pub struct Store {
    tx: mpsc::Sender<WriteTask>,
    db_path: Arc<PathBuf>,
}

impl Store {
    /// Initialises the database and starts the writer thread. The thread
    /// exits once every `Store` clone has been dropped.
    pub fn open(db_path: &Path) -> Result<(Self, std::thread::JoinHandle<()>), DatabaseError> {
        let mut conn = initialise_database(db_path)?;
        let (tx, mut rx) = mpsc::channel::<WriteTask>(256);

        let handle = std::thread::spawn(move || {
            while let Some(task) = rx.blocking_recv() {
                task(&mut conn);
            }
            tracing::debug!("state writer stopped");
        });

        Ok((
            Self {
                tx,
                db_path: Arc::new(db_path.to_path_buf()),
            },
            handle,
        ))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Runs a mutating task on the writer thread. The closure owns the
    /// transaction scope; batch work rolls back as a unit on error.
    pub async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let task: WriteTask = Box::new(move |conn| {
            let _ = done_tx.send(f(conn));
        });
        self.tx
            .send(task)
            .await
            .map_err(|_| StoreError::WriterGone)?;
        done_rx.await.map_err(|_| StoreError::WriterGone)?
    }

    /// Runs a read on a short-lived connection, retrying busy locks.
    pub async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: Fn(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = Arc::clone(&self.db_path);
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path).map_err(|e| match e {
                DatabaseError::Sqlite(e) => StoreError::Sqlite(e),
                other => StoreError::Database(other.to_string()),
            })?;
            store::with_retry(|| f(&conn))
        })
        .await
        .map_err(|_| StoreError::WriterGone)?
    }

    // -------------------------------------------------------------------------
    // Contract operations
    // -------------------------------------------------------------------------

    pub async fn upsert_folder(
        &self,
        path: String,
        ignore_transcribing: bool,
        ignore_converting: bool,
    ) -> Result<FolderId, StoreError> {
        self.write(move |conn| {
            store::with_retry(|| {
                store::upsert_folder(conn, &path, ignore_transcribing, ignore_converting)
            })
        })
        .await
    }

    pub async fn list_folders(&self) -> Result<Vec<RecordingFolder>, StoreError> {
        self.read(store::list_folders).await
    }

    pub async fn upsert_known_file(
        &self,
        folder_id: FolderId,
        file_name: String,
        extension: String,
        datetimes: Option<String>,
    ) -> Result<KnownFileId, StoreError> {
        self.write(move |conn| {
            store::with_retry(|| {
                store::upsert_known_file(
                    conn,
                    folder_id,
                    &file_name,
                    &extension,
                    datetimes.as_deref(),
                )
            })
        })
        .await
    }

    pub async fn note_audio(&self, id: KnownFileId, mtime: i64) -> Result<(), StoreError> {
        self.write(move |conn| store::with_retry(|| store::note_audio(conn, id, mtime)))
            .await
    }

    pub async fn note_transcript(&self, id: KnownFileId, mtime: i64) -> Result<(), StoreError> {
        self.write(move |conn| store::with_retry(|| store::note_transcript(conn, id, mtime)))
            .await
    }

    pub async fn lookup_known_file(
        &self,
        id: KnownFileId,
    ) -> Result<Option<KnownFileRef>, StoreError> {
        self.read(move |conn| store::lookup_known_file(conn, id)).await
    }

    pub async fn load_known_set(&self) -> Result<Vec<(FolderId, String)>, StoreError> {
        self.read(store::load_known_set).await
    }

    /// Durable half of an enqueue; returns false when the item is already
    /// pending or carries a skip record.
    pub async fn enqueue(&self, kind: QueueKind, id: KnownFileId) -> Result<bool, StoreError> {
        self.write(move |conn| store::with_retry(|| store::enqueue(conn, kind, id)))
            .await
    }

    pub async fn ack(&self, kind: QueueKind, id: KnownFileId) -> Result<(), StoreError> {
        self.write(move |conn| store::with_retry(|| store::ack(conn, kind, id)))
            .await
    }

    pub async fn nack(&self, id: KnownFileId, reason: SkipReason) -> Result<(), StoreError> {
        self.write(move |conn| store::with_retry(|| store::nack(conn, id, &reason)))
            .await
    }

    pub async fn load_queue(&self, kind: QueueKind) -> Result<Vec<KnownFileId>, StoreError> {
        self.read(move |conn| store::load_queue(conn, kind)).await
    }

    pub async fn record_skip(
        &self,
        id: KnownFileId,
        reason: SkipReason,
    ) -> Result<bool, StoreError> {
        self.write(move |conn| store::with_retry(|| store::record_skip(conn, id, &reason)))
            .await
    }

    pub async fn is_skipped(&self, id: KnownFileId) -> Result<bool, StoreError> {
        self.read(move |conn| store::is_skipped(conn, id)).await
    }

    pub async fn record_pair(
        &self,
        audio_file_id: i64,
        transcript_file_id: i64,
    ) -> Result<(), StoreError> {
        self.write(move |conn| {
            store::with_retry(|| store::record_pair(conn, audio_file_id, transcript_file_id))
        })
        .await
    }

    pub async fn replace_pairs(&self, pairs: Vec<(i64, i64)>) -> Result<(), StoreError> {
        self.write(move |conn| store::with_retry(|| store::replace_pairs(conn, &pairs)))
            .await
    }

    pub async fn list_pairs(&self) -> Result<Vec<(i64, i64)>, StoreError> {
        self.read(store::list_pairs).await
    }

    pub async fn list_dangling(&self) -> Result<(Vec<i64>, Vec<i64>), StoreError> {
        self.read(store::list_dangling).await
    }

    pub async fn list_audio_entries(&self) -> Result<Vec<ArtifactEntry>, StoreError> {
        self.read(store::list_audio_entries).await
    }

    pub async fn list_transcript_entries(&self) -> Result<Vec<ArtifactEntry>, StoreError> {
        self.read(store::list_transcript_entries).await
    }

    /// Syncs the queue mirrors to the live in-memory queues and writes the
    /// on-disk snapshot in the same pass. The table rewrite is one
    /// transaction; the JSON artifact is best-effort ground truth.
    pub async fn export_snapshot(
        &self,
        transcribe_queue: Vec<KnownFileId>,
        convert_queue: Vec<KnownFileId>,
        snapshot_path: PathBuf,
    ) -> Result<Snapshot, StoreError> {
        self.write(move |conn| {
            store::with_retry(|| {
                store::replace_queue_tables(conn, &transcribe_queue, &convert_queue)
            })?;
            let snapshot =
                store::with_retry(|| store::build_snapshot(conn, transcribe_queue.clone(), convert_queue.clone()))?;
            let json = serde_json::to_string_pretty(&snapshot)
                .map_err(|e| StoreError::Snapshot(e.to_string()))?;
            std::fs::write(&snapshot_path, json)
                .map_err(|e| StoreError::Snapshot(format!("{}: {e}", snapshot_path.display())))?;
            tracing::info!("state snapshot written to {}", snapshot_path.display());
            Ok(snapshot)
        })
        .await
    }

    /// Replays an on-disk snapshot into the store. Used for cold start when
    /// the database file is new but a `state_backup.json` survives.
    pub async fn import_snapshot(&self, snapshot_path: PathBuf) -> Result<Snapshot, StoreError> {
        self.write(move |conn| {
            let json = std::fs::read_to_string(&snapshot_path)
                .map_err(|e| StoreError::Snapshot(format!("{}: {e}", snapshot_path.display())))?;
            let snapshot: Snapshot = serde_json::from_str(&json)
                .map_err(|e| StoreError::Snapshot(e.to_string()))?;
            store::with_retry(|| store::apply_snapshot(conn, &snapshot))?;
            Ok(snapshot)
        })
        .await
    }
}
