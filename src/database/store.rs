//! Row-level operations on the state database.
//!
//! Everything here works against a borrowed connection: the single-writer
//! worker ([`super::writer`]) calls these for mutations, readers call them
//! on short-lived connections of their own. Busy-lock errors are retried
//! with exponential backoff by [`with_retry`]; logical errors surface to
//! the caller immediately.

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::filename;
use crate::governor::RateLimiter;

pub type FolderId = i64;
pub type KnownFileId = i64;

/// Bounded attempts for a locked store before giving up.
const MAX_WRITE_ATTEMPTS: u32 = 5;

/// State-store error type. `Busy` is the retriable kind; everything else
/// is a logical error the caller has to handle.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store still locked after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("known file {0} not found")]
    UnknownFile(KnownFileId),

    #[error("state writer is not running")]
    WriterGone,

    #[error("database error: {0}")]
    Database(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

/// A directory the scanner watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingFolder {
    pub id: FolderId,
    pub path: PathBuf,
    pub ignore_transcribing: bool,
    pub ignore_converting: bool,
}

/// Resolved location of a known file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownFileRef {
    pub id: KnownFileId,
    pub folder_path: PathBuf,
    pub file_name: String,
    pub extension: String,
}

impl KnownFileRef {
    pub fn full_path(&self) -> PathBuf {
        self.folder_path.join(&self.file_name)
    }
}

/// Catalog row used by the pairing pass.
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    /// Row id in `audio_files` / `transcript_files`.
    pub artifact_id: i64,
    pub known_file_id: KnownFileId,
    pub folder_id: FolderId,
    pub file_name: String,
    pub datetimes: Option<String>,
}

/// Durable reason a file is excluded from future work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    InvalidFilename,
    TranscriptionFailed,
    TranscriptionOutputError,
    ConversionFailed,
    IncorrectAudioShape,
    UserIgnore,
    Other,
    /// Remote backend failure with the transport/server detail attached.
    WebuiError(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidFilename => f.write_str("invalid_filename"),
            SkipReason::TranscriptionFailed => f.write_str("transcription_failed"),
            SkipReason::TranscriptionOutputError => f.write_str("transcription_output_error"),
            SkipReason::ConversionFailed => f.write_str("conversion_failed"),
            SkipReason::IncorrectAudioShape => f.write_str("incorrect_audio_shape"),
            SkipReason::UserIgnore => f.write_str("user_ignore"),
            SkipReason::Other => f.write_str("other"),
            SkipReason::WebuiError(detail) => write!(f, "webui_error:{detail}"),
        }
    }
}

impl From<&str> for SkipReason {
    fn from(code: &str) -> Self {
        match code {
            "invalid_filename" => SkipReason::InvalidFilename,
            "transcription_failed" => SkipReason::TranscriptionFailed,
            "transcription_output_error" => SkipReason::TranscriptionOutputError,
            "conversion_failed" => SkipReason::ConversionFailed,
            "incorrect_audio_shape" => SkipReason::IncorrectAudioShape,
            "user_ignore" => SkipReason::UserIgnore,
            other => match other.strip_prefix("webui_error:") {
                Some(detail) => SkipReason::WebuiError(detail.to_string()),
                None => SkipReason::Other,
            },
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Runs `op`, retrying transient "database is locked" failures with
/// exponential backoff (1 s base, capped per the governor). Logical errors
/// are returned on the first occurrence.
pub fn with_retry<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T, StoreError> {
    let mut backoff = RateLimiter::new(Duration::from_secs(60));
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) => {
                if attempt == MAX_WRITE_ATTEMPTS {
                    return Err(StoreError::Busy {
                        attempts: MAX_WRITE_ATTEMPTS,
                    });
                }
                tracing::warn!(
                    "state store is locked, retrying in {:?} (attempt {attempt})",
                    backoff.interval()
                );
                std::thread::sleep(backoff.interval());
                backoff.increment();
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(StoreError::Busy {
        attempts: MAX_WRITE_ATTEMPTS,
    })
}

// =============================================================================
// Folders
// =============================================================================

pub fn upsert_folder(
    conn: &Connection,
    path: &str,
    ignore_transcribing: bool,
    ignore_converting: bool,
) -> rusqlite::Result<FolderId> {
    conn.execute(
        "INSERT INTO recordings_folders (folder_path, ignore_transcribing, ignore_converting) \
         VALUES (?1, ?2, ?3) \
         ON CONFLICT(folder_path) DO UPDATE SET \
             ignore_transcribing = excluded.ignore_transcribing, \
             ignore_converting = excluded.ignore_converting",
        (path, ignore_transcribing as i64, ignore_converting as i64),
    )?;
    conn.query_row(
        "SELECT id FROM recordings_folders WHERE folder_path = ?1",
        [path],
        |row| row.get(0),
    )
}

pub fn list_folders(conn: &Connection) -> rusqlite::Result<Vec<RecordingFolder>> {
    let mut stmt = conn.prepare(
        "SELECT id, folder_path, ignore_transcribing, ignore_converting \
         FROM recordings_folders ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(RecordingFolder {
            id: row.get(0)?,
            path: PathBuf::from(row.get::<_, String>(1)?),
            ignore_transcribing: row.get::<_, i64>(2)? != 0,
            ignore_converting: row.get::<_, i64>(3)? != 0,
        })
    })?;
    rows.collect()
}

// =============================================================================
// Known files and artifacts
// =============================================================================

fn extension_id(conn: &Connection, extension: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM extensions WHERE extension = ?1",
        [extension],
        |row| row.get(0),
    )
    .optional()
}

/// Inserts a known file if this (folder, name) has not been seen, returning
/// the row id either way. Idempotent under identical inputs.
pub fn upsert_known_file(
    conn: &Connection,
    folder_id: FolderId,
    file_name: &str,
    extension: &str,
    datetimes: Option<&str>,
) -> rusqlite::Result<KnownFileId> {
    if let Some(id) = conn
        .query_row(
            "SELECT id FROM known_files WHERE file_name = ?1 AND folder_id = ?2",
            (file_name, folder_id),
            |row| row.get(0),
        )
        .optional()?
    {
        return Ok(id);
    }

    let ext_id = extension_id(conn, extension)?;
    conn.execute(
        "INSERT INTO known_files (file_name, folder_id, extension_id, datetimes) \
         VALUES (?1, ?2, ?3, ?4)",
        (file_name, folder_id, ext_id, datetimes),
    )?;
    Ok(conn.last_insert_rowid())
}

/// Records (or refreshes) the audio artifact row for a known file.
pub fn note_audio(
    conn: &Connection,
    known_file_id: KnownFileId,
    mtime: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audio_files (known_file_id, unix_timestamp) VALUES (?1, ?2) \
         ON CONFLICT(known_file_id) DO UPDATE SET unix_timestamp = excluded.unix_timestamp",
        (known_file_id, mtime),
    )?;
    Ok(())
}

/// Records (or refreshes) the transcript artifact row for a known file.
pub fn note_transcript(
    conn: &Connection,
    known_file_id: KnownFileId,
    mtime: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO transcript_files (known_file_id, unix_timestamp) VALUES (?1, ?2) \
         ON CONFLICT(known_file_id) DO UPDATE SET unix_timestamp = excluded.unix_timestamp",
        (known_file_id, mtime),
    )?;
    Ok(())
}

/// Resolves a known-file id back to its folder path, name, and extension.
pub fn lookup_known_file(
    conn: &Connection,
    id: KnownFileId,
) -> rusqlite::Result<Option<KnownFileRef>> {
    conn.query_row(
        "SELECT k.id, r.folder_path, k.file_name, COALESCE(e.extension, '') \
         FROM known_files k \
         JOIN recordings_folders r ON k.folder_id = r.id \
         LEFT JOIN extensions e ON k.extension_id = e.id \
         WHERE k.id = ?1",
        [id],
        |row| {
            Ok(KnownFileRef {
                id: row.get(0)?,
                folder_path: PathBuf::from(row.get::<_, String>(1)?),
                file_name: row.get(2)?,
                extension: row.get(3)?,
            })
        },
    )
    .optional()
}

/// Full known set as (folder id, file name), for rehydrating the scanner's
/// in-memory dedup set.
pub fn load_known_set(conn: &Connection) -> rusqlite::Result<Vec<(FolderId, String)>> {
    let mut stmt = conn.prepare("SELECT folder_id, file_name FROM known_files ORDER BY id")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

fn list_artifacts(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ArtifactEntry>> {
    let sql = format!(
        "SELECT a.id, a.known_file_id, k.folder_id, k.file_name, k.datetimes \
         FROM {table} a JOIN known_files k ON a.known_file_id = k.id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(ArtifactEntry {
            artifact_id: row.get(0)?,
            known_file_id: row.get(1)?,
            folder_id: row.get(2)?,
            file_name: row.get(3)?,
            datetimes: row.get(4)?,
        })
    })?;
    rows.collect()
}

pub fn list_audio_entries(conn: &Connection) -> rusqlite::Result<Vec<ArtifactEntry>> {
    list_artifacts(conn, "audio_files")
}

pub fn list_transcript_entries(conn: &Connection) -> rusqlite::Result<Vec<ArtifactEntry>> {
    list_artifacts(conn, "transcript_files")
}

// =============================================================================
// Work queues
// =============================================================================

/// Which durable queue mirror an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Transcribe,
    Convert,
}

impl QueueKind {
    fn table(self) -> &'static str {
        match self {
            QueueKind::Transcribe => "transcribe_queue",
            QueueKind::Convert => "convert_queue",
        }
    }
}

/// Appends `id` to the durable queue unless it is already pending or has a
/// skip record. Returns whether a row was inserted.
pub fn enqueue(conn: &Connection, kind: QueueKind, id: KnownFileId) -> rusqlite::Result<bool> {
    let table = kind.table();
    let sql = format!(
        "INSERT INTO {table} (known_file_id) \
         SELECT ?1 \
         WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE known_file_id = ?1) \
           AND NOT EXISTS (SELECT 1 FROM skip_files WHERE known_file_id = ?1)"
    );
    Ok(conn.execute(&sql, [id])? > 0)
}

/// Removes a completed item from the durable mirror.
pub fn ack(conn: &Connection, kind: QueueKind, id: KnownFileId) -> rusqlite::Result<()> {
    let sql = format!("DELETE FROM {} WHERE known_file_id = ?1", kind.table());
    conn.execute(&sql, [id])?;
    Ok(())
}

/// Leaves the queue row intact and records the skip reason atomically, so
/// the item is visible for operator inspection but never re-admitted.
pub fn nack(
    conn: &mut Connection,
    id: KnownFileId,
    reason: &SkipReason,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT OR IGNORE INTO skip_files (known_file_id, reason) VALUES (?1, ?2)",
        (id, reason.to_string()),
    )?;
    tx.commit()
}

/// Pending ids in FIFO order, for rehydrating the in-memory queue.
pub fn load_queue(conn: &Connection, kind: QueueKind) -> rusqlite::Result<Vec<KnownFileId>> {
    let sql = format!(
        "SELECT known_file_id FROM {} ORDER BY id ASC",
        kind.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

/// Rewrites both queue mirrors to match the in-memory queues, in one
/// transaction. Used by the snapshot exporter.
pub fn replace_queue_tables(
    conn: &mut Connection,
    transcribe: &[KnownFileId],
    convert: &[KnownFileId],
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM transcribe_queue", [])?;
    tx.execute("DELETE FROM convert_queue", [])?;
    for id in transcribe {
        tx.execute(
            "INSERT INTO transcribe_queue (known_file_id) VALUES (?1)",
            [id],
        )?;
    }
    for id in convert {
        tx.execute("INSERT INTO convert_queue (known_file_id) VALUES (?1)", [id])?;
    }
    tx.commit()
}

// =============================================================================
// Skip records
// =============================================================================

/// Records a skip reason for a file. Returns false when a record already
/// existed (the original reason is kept).
pub fn record_skip(
    conn: &Connection,
    id: KnownFileId,
    reason: &SkipReason,
) -> rusqlite::Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO skip_files (known_file_id, reason) VALUES (?1, ?2)",
        (id, reason.to_string()),
    )?;
    Ok(inserted > 0)
}

pub fn is_skipped(conn: &Connection, id: KnownFileId) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM skip_files WHERE known_file_id = ?1",
        [id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Operator-only: lifts the exclusion so the file can be re-admitted.
pub fn clear_skip(conn: &Connection, id: KnownFileId) -> rusqlite::Result<bool> {
    Ok(conn.execute("DELETE FROM skip_files WHERE known_file_id = ?1", [id])? > 0)
}

pub fn list_skips(conn: &Connection) -> rusqlite::Result<Vec<(KnownFileId, SkipReason)>> {
    let mut stmt =
        conn.prepare("SELECT known_file_id, reason FROM skip_files ORDER BY known_file_id")?;
    let rows = stmt.query_map([], |row| {
        let id: KnownFileId = row.get(0)?;
        let reason: String = row.get(1)?;
        Ok((id, SkipReason::from(reason.as_str())))
    })?;
    rows.collect()
}

// =============================================================================
// Matched pairs
// =============================================================================

pub fn record_pair(
    conn: &Connection,
    audio_file_id: i64,
    transcript_file_id: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO matched_pairs (audio_file_id, transcript_file_id) VALUES (?1, ?2)",
        (audio_file_id, transcript_file_id),
    )?;
    Ok(())
}

pub fn list_pairs(conn: &Connection) -> rusqlite::Result<Vec<(i64, i64)>> {
    let mut stmt =
        conn.prepare("SELECT audio_file_id, transcript_file_id FROM matched_pairs ORDER BY id")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

/// Rebuilds the pair table wholesale from a fresh matching pass.
pub fn replace_pairs(conn: &mut Connection, pairs: &[(i64, i64)]) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM matched_pairs", [])?;
    for (audio_id, transcript_id) in pairs {
        tx.execute(
            "INSERT INTO matched_pairs (audio_file_id, transcript_file_id) VALUES (?1, ?2)",
            (audio_id, transcript_id),
        )?;
    }
    tx.commit()
}

/// Artifacts with no partner: audio rows missing a transcript pair, and
/// transcript rows missing an audio pair.
pub fn list_dangling(conn: &Connection) -> rusqlite::Result<(Vec<i64>, Vec<i64>)> {
    let mut stmt = conn.prepare(
        "SELECT id FROM audio_files WHERE id NOT IN (SELECT audio_file_id FROM matched_pairs)",
    )?;
    let audio: Vec<i64> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id FROM transcript_files \
         WHERE id NOT IN (SELECT transcript_file_id FROM matched_pairs)",
    )?;
    let transcripts: Vec<i64> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    Ok((audio, transcripts))
}

// =============================================================================
// Snapshot
// =============================================================================

/// Ground-truth recovery artifact written to `state_backup.json` on every
/// shutdown and opportunistically between scans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub known_files: Vec<(FolderId, String)>,
    pub transcribe_queue: Vec<KnownFileId>,
    pub convert_queue: Vec<KnownFileId>,
    pub skip_files: Vec<(KnownFileId, String)>,
}

/// Builds a snapshot from the catalog plus the live in-memory queues.
pub fn build_snapshot(
    conn: &Connection,
    transcribe_queue: Vec<KnownFileId>,
    convert_queue: Vec<KnownFileId>,
) -> rusqlite::Result<Snapshot> {
    let known_files = load_known_set(conn)?;
    let skip_files = list_skips(conn)?
        .into_iter()
        .map(|(id, reason)| (id, reason.to_string()))
        .collect();
    Ok(Snapshot {
        known_files,
        transcribe_queue,
        convert_queue,
        skip_files,
    })
}

/// Replays a snapshot into an empty store: minimal known-file rows, both
/// queue mirrors, and the skip set, in one transaction.
pub fn apply_snapshot(conn: &mut Connection, snapshot: &Snapshot) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for (folder_id, file_name) in &snapshot.known_files {
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM known_files WHERE file_name = ?1 AND folder_id = ?2",
            (file_name, folder_id),
            |row| row.get(0),
        )?;
        if exists == 0 {
            let token = filename::datetime_token(file_name);
            tx.execute(
                "INSERT INTO known_files (file_name, folder_id, datetimes) VALUES (?1, ?2, ?3)",
                (file_name, folder_id, token),
            )?;
        }
    }
    tx.execute("DELETE FROM transcribe_queue", [])?;
    tx.execute("DELETE FROM convert_queue", [])?;
    for id in &snapshot.transcribe_queue {
        tx.execute(
            "INSERT INTO transcribe_queue (known_file_id) VALUES (?1)",
            [id],
        )?;
    }
    for id in &snapshot.convert_queue {
        tx.execute("INSERT INTO convert_queue (known_file_id) VALUES (?1)", [id])?;
    }
    for (id, reason) in &snapshot.skip_files {
        tx.execute(
            "INSERT OR IGNORE INTO skip_files (known_file_id, reason) VALUES (?1, ?2)",
            (id, reason),
        )?;
    }
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::migrations::run_migrations;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        run_migrations(&mut conn).unwrap();
        conn
    }

    fn seed_file(conn: &Connection, name: &str) -> KnownFileId {
        let folder = upsert_folder(conn, "/rec", false, false).unwrap();
        let (_, ext) = crate::filename::split_name(name);
        upsert_known_file(conn, folder, name, &ext, crate::filename::datetime_token(name)).unwrap()
    }

    #[test]
    fn test_upsert_folder_is_idempotent_and_updates_flags() {
        let conn = test_conn();
        let a = upsert_folder(&conn, "/rec", false, false).unwrap();
        let b = upsert_folder(&conn, "/rec", true, false).unwrap();
        assert_eq!(a, b);

        let folders = list_folders(&conn).unwrap();
        assert_eq!(folders.len(), 1);
        assert!(folders[0].ignore_transcribing);
        assert!(!folders[0].ignore_converting);
    }

    #[test]
    fn test_upsert_known_file_is_idempotent() {
        let conn = test_conn();
        let folder = upsert_folder(&conn, "/rec", false, false).unwrap();
        let a = upsert_known_file(
            &conn,
            folder,
            "2024-05-06_10-00-00.wav",
            "wav",
            Some("2024-05-06_10-00-00"),
        )
        .unwrap();
        let b = upsert_known_file(
            &conn,
            folder,
            "2024-05-06_10-00-00.wav",
            "wav",
            Some("2024-05-06_10-00-00"),
        )
        .unwrap();
        assert_eq!(a, b);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM known_files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_lookup_known_file_resolves_path() {
        let conn = test_conn();
        let id = seed_file(&conn, "2024-05-06_10-00-00.wav");
        let file = lookup_known_file(&conn, id).unwrap().unwrap();
        assert_eq!(file.extension, "wav");
        assert_eq!(
            file.full_path(),
            PathBuf::from("/rec/2024-05-06_10-00-00.wav")
        );
        assert!(lookup_known_file(&conn, 9999).unwrap().is_none());
    }

    #[test]
    fn test_enqueue_suppresses_duplicates_while_pending() {
        let conn = test_conn();
        let id = seed_file(&conn, "2024-05-06_10-00-00.wav");

        assert!(enqueue(&conn, QueueKind::Transcribe, id).unwrap());
        assert!(!enqueue(&conn, QueueKind::Transcribe, id).unwrap());
        assert_eq!(load_queue(&conn, QueueKind::Transcribe).unwrap(), vec![id]);

        // Released after completion, re-admission is allowed again.
        ack(&conn, QueueKind::Transcribe, id).unwrap();
        assert!(enqueue(&conn, QueueKind::Transcribe, id).unwrap());
    }

    #[test]
    fn test_skip_record_blocks_enqueue() {
        let conn = test_conn();
        let id = seed_file(&conn, "2024-05-06_10-00-00.wav");

        assert!(record_skip(&conn, id, &SkipReason::TranscriptionFailed).unwrap());
        assert!(!enqueue(&conn, QueueKind::Transcribe, id).unwrap());
        assert!(!enqueue(&conn, QueueKind::Convert, id).unwrap());
        assert!(is_skipped(&conn, id).unwrap());

        // Operator clears the record; admission works again.
        assert!(clear_skip(&conn, id).unwrap());
        assert!(enqueue(&conn, QueueKind::Convert, id).unwrap());
    }

    #[test]
    fn test_record_skip_keeps_first_reason() {
        let conn = test_conn();
        let id = seed_file(&conn, "badname.wav");

        assert!(record_skip(&conn, id, &SkipReason::InvalidFilename).unwrap());
        assert!(!record_skip(&conn, id, &SkipReason::Other).unwrap());

        let skips = list_skips(&conn).unwrap();
        assert_eq!(skips, vec![(id, SkipReason::InvalidFilename)]);
    }

    #[test]
    fn test_nack_records_skip_and_leaves_row() {
        let mut conn = test_conn();
        let id = seed_file(&conn, "2024-05-06_10-00-00.wav");
        assert!(enqueue(&conn, QueueKind::Transcribe, id).unwrap());

        nack(&mut conn, id, &SkipReason::TranscriptionFailed).unwrap();
        assert!(is_skipped(&conn, id).unwrap());
        assert_eq!(load_queue(&conn, QueueKind::Transcribe).unwrap(), vec![id]);
    }

    #[test]
    fn test_queue_is_fifo() {
        let conn = test_conn();
        let folder = upsert_folder(&conn, "/rec", false, false).unwrap();
        let mut ids = Vec::new();
        for name in [
            "2024-05-06_12-00-00.wav",
            "2024-05-06_11-00-00.wav",
            "2024-05-06_10-00-00.wav",
        ] {
            let id = upsert_known_file(
                &conn,
                folder,
                name,
                "wav",
                crate::filename::datetime_token(name),
            )
            .unwrap();
            enqueue(&conn, QueueKind::Transcribe, id).unwrap();
            ids.push(id);
        }
        assert_eq!(load_queue(&conn, QueueKind::Transcribe).unwrap(), ids);
    }

    #[test]
    fn test_skip_reason_round_trip() {
        for reason in [
            SkipReason::InvalidFilename,
            SkipReason::TranscriptionFailed,
            SkipReason::TranscriptionOutputError,
            SkipReason::ConversionFailed,
            SkipReason::IncorrectAudioShape,
            SkipReason::UserIgnore,
            SkipReason::Other,
            SkipReason::WebuiError("connection refused".to_string()),
        ] {
            let code = reason.to_string();
            assert_eq!(SkipReason::from(code.as_str()), reason);
        }
        assert_eq!(
            SkipReason::WebuiError("WebUI base_url is not configured".into()).to_string(),
            "webui_error:WebUI base_url is not configured"
        );
    }

    #[test]
    fn test_pairs_and_dangling() {
        let conn = test_conn();
        let folder = upsert_folder(&conn, "/rec", false, false).unwrap();
        let audio = upsert_known_file(
            &conn,
            folder,
            "2024-05-06_10-00-00.wav",
            "wav",
            Some("2024-05-06_10-00-00"),
        )
        .unwrap();
        let transcript = upsert_known_file(
            &conn,
            folder,
            "2024-05-06_10-00-00.txt",
            "txt",
            Some("2024-05-06_10-00-00"),
        )
        .unwrap();
        let lonely = upsert_known_file(
            &conn,
            folder,
            "2024-05-07_09-00-00.wav",
            "wav",
            Some("2024-05-07_09-00-00"),
        )
        .unwrap();

        note_audio(&conn, audio, 100).unwrap();
        note_transcript(&conn, transcript, 101).unwrap();
        note_audio(&conn, lonely, 102).unwrap();

        let audio_entries = list_audio_entries(&conn).unwrap();
        let transcript_entries = list_transcript_entries(&conn).unwrap();
        assert_eq!(audio_entries.len(), 2);
        assert_eq!(transcript_entries.len(), 1);

        record_pair(
            &conn,
            audio_entries[0].artifact_id,
            transcript_entries[0].artifact_id,
        )
        .unwrap();
        assert_eq!(list_pairs(&conn).unwrap().len(), 1);

        let (dangling_audio, dangling_transcripts) = list_dangling(&conn).unwrap();
        assert_eq!(dangling_audio.len(), 1);
        assert!(dangling_transcripts.is_empty());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut conn = test_conn();
        let folder = upsert_folder(&conn, "/rec", false, false).unwrap();
        let a = upsert_known_file(
            &conn,
            folder,
            "2024-05-06_10-00-00.wav",
            "wav",
            Some("2024-05-06_10-00-00"),
        )
        .unwrap();
        let b = upsert_known_file(
            &conn,
            folder,
            "2024-05-06_09-00-00.wav",
            "wav",
            Some("2024-05-06_09-00-00"),
        )
        .unwrap();
        record_skip(&conn, b, &SkipReason::UserIgnore).unwrap();

        let snapshot = build_snapshot(&conn, vec![a], vec![b]).unwrap();

        // A fresh store plus the same folder row; replaying the snapshot
        // must rebuild queues, skip set, and known set.
        let mut fresh = test_conn();
        upsert_folder(&fresh, "/rec", false, false).unwrap();
        apply_snapshot(&mut fresh, &snapshot).unwrap();

        assert_eq!(load_known_set(&fresh).unwrap().len(), 2);
        assert_eq!(load_queue(&fresh, QueueKind::Transcribe).unwrap().len(), 1);
        assert_eq!(load_queue(&fresh, QueueKind::Convert).unwrap().len(), 1);
        assert_eq!(list_skips(&fresh).unwrap().len(), 1);

        let again = build_snapshot(
            &fresh,
            load_queue(&fresh, QueueKind::Transcribe).unwrap(),
            load_queue(&fresh, QueueKind::Convert).unwrap(),
        )
        .unwrap();
        assert_eq!(again.transcribe_queue.len(), snapshot.transcribe_queue.len());
        assert_eq!(again.skip_files, snapshot.skip_files);
    }

    #[test]
    fn test_with_retry_passes_logical_errors_through() {
        let result: Result<(), StoreError> = with_retry(|| {
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
    }
}
