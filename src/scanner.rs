//! Recording-folder scanner.
//!
//! Periodically enumerates the watched folders, classifies anything new
//! against the closed extension sets, records it in the state store, and
//! admits work to the transcribe and convert queues. New files are
//! processed newest first so the latest recordings surface soonest.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;

use crate::config::ScannerConfig;
use crate::database::store::{self, FolderId, KnownFileId, RecordingFolder, SkipReason, StoreError};
use crate::database::writer::Store;
use crate::filename;
use crate::governor::RateLimiter;
use crate::queue::{ConvertHint, ConvertItem, WorkQueue};

/// A directory entry classified and ready for admission.
#[derive(Debug, Clone)]
struct PreparedFile {
    folder_id: FolderId,
    file_name: String,
    extension: String,
    datetimes: Option<String>,
    mtime: i64,
    is_audio: bool,
    transcript_exists: bool,
    needs_conversion: bool,
    folder_path: PathBuf,
    ignore_transcribing: bool,
}

pub struct Scanner {
    store: Store,
    transcribe_queue: WorkQueue<KnownFileId>,
    convert_queue: WorkQueue<ConvertItem>,
    config: ScannerConfig,
    snapshot_path: PathBuf,
    known: HashSet<(FolderId, String)>,
    limiter: RateLimiter,
    empty_scans: u32,
}

impl Scanner {
    pub fn new(
        store: Store,
        transcribe_queue: WorkQueue<KnownFileId>,
        convert_queue: WorkQueue<ConvertItem>,
        config: ScannerConfig,
        snapshot_path: PathBuf,
        known: HashSet<(FolderId, String)>,
    ) -> Self {
        Self {
            store,
            transcribe_queue,
            convert_queue,
            config,
            snapshot_path,
            known,
            limiter: RateLimiter::default(),
            empty_scans: 0,
        }
    }

    /// Scan loop: runs until shutdown. Folder errors never end the loop;
    /// empty passes back off through the governor.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let new_files = match self.scan_pass().await {
                Ok(count) => count,
                Err(e) => {
                    tracing::error!("scanner pass failed: {e}");
                    0
                }
            };

            if new_files == 0 {
                self.empty_scans += 1;
                if self.empty_scans == 2 {
                    self.export_snapshot().await;
                }
                self.limiter.increment();
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = self.limiter.sleep() => {}
                }
                continue;
            }

            self.empty_scans = 0;
            self.limiter.reset();
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(Duration::from_secs(self.config.scan_interval_secs)) => {}
            }
        }
        tracing::info!("scanner stopped");
    }

    async fn export_snapshot(&self) {
        let result = self
            .store
            .export_snapshot(
                self.transcribe_queue.snapshot_ids(),
                self.convert_queue.snapshot_ids(),
                self.snapshot_path.clone(),
            )
            .await;
        if let Err(e) = result {
            tracing::error!("opportunistic snapshot export failed: {e}");
        }
    }

    /// One pass over every folder. Returns how many new files were seen.
    async fn scan_pass(&mut self) -> Result<usize, StoreError> {
        let folders = self.store.list_folders().await?;
        tracing::debug!("Scanning {} directories.", folders.len());

        let folder_map: HashMap<FolderId, RecordingFolder> =
            folders.into_iter().map(|f| (f.id, f)).collect();

        let mut current: HashSet<(FolderId, String)> = HashSet::new();
        for folder in folder_map.values() {
            let entries = match std::fs::read_dir(&folder.path) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!("cannot read folder {}: {e}", folder.path.display());
                    continue;
                }
            };
            for entry in entries.flatten() {
                if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let (_, extension) = filename::split_name(&name);
                if filename::is_audio_extension(&extension)
                    || filename::is_transcript_extension(&extension)
                {
                    current.insert((folder.id, name));
                }
            }
        }

        let mut new_files: Vec<(FolderId, String)> = current
            .into_iter()
            .filter(|key| !self.known.contains(key))
            .collect();
        if new_files.is_empty() {
            return Ok(0);
        }

        // Newest first: reverse lexical equals newest-first under the
        // timestamp naming convention.
        new_files.sort_by(|a, b| b.1.cmp(&a.1));
        tracing::info!("New files found: {}", new_files.len());

        let total = new_files.len();
        for batch in new_files.chunks(self.config.batch_size) {
            let prepared: Vec<PreparedFile> = batch
                .iter()
                .filter_map(|(folder_id, name)| {
                    folder_map
                        .get(folder_id)
                        .and_then(|folder| classify(folder, name))
                })
                .collect();

            match self.admit_batch(prepared).await {
                Ok(()) => {}
                Err(e) => {
                    // The batch transaction rolled back; later batches
                    // still get their chance.
                    tracing::error!("scanner batch failed: {e}");
                }
            }
            for key in batch {
                self.known.insert(key.clone());
            }
        }

        Ok(total)
    }

    /// Writes one batch to the store in a single transaction, then admits
    /// the surviving files to the queues.
    async fn admit_batch(&self, prepared: Vec<PreparedFile>) -> Result<(), StoreError> {
        let recorded: Vec<(PreparedFile, KnownFileId)> = self
            .store
            .write(move |conn| {
                store::with_retry(|| {
                    let tx = conn.transaction()?;
                    let mut out = Vec::with_capacity(prepared.len());
                    for file in &prepared {
                        let id = store::upsert_known_file(
                            &tx,
                            file.folder_id,
                            &file.file_name,
                            &file.extension,
                            file.datetimes.as_deref(),
                        )?;
                        if file.datetimes.is_none() {
                            store::record_skip(&tx, id, &SkipReason::InvalidFilename)?;
                        }
                        if file.is_audio {
                            store::note_audio(&tx, id, file.mtime)?;
                        } else {
                            store::note_transcript(&tx, id, file.mtime)?;
                        }
                        out.push((file.clone(), id));
                    }
                    tx.commit()?;
                    Ok(out)
                })
            })
            .await?;

        for (file, id) in recorded {
            let path = file.folder_path.join(&file.file_name);
            if file.datetimes.is_none() {
                tracing::warn!("Skipping {}: invalid_filename", path.display());
                continue;
            }
            if !file.is_audio {
                continue;
            }

            if file.transcript_exists {
                tracing::debug!(
                    "Skipping transcription for {}: transcript already exists.",
                    path.display()
                );
            } else if !file.ignore_transcribing
                && self.transcribe_queue.enqueue(id).await?
            {
                tracing::info!("File {} added to transcription queue", path.display());
            }

            if file.needs_conversion {
                let admitted = self
                    .convert_queue
                    .enqueue(ConvertItem {
                        id,
                        hint: Some(ConvertHint {
                            folder_path: file.folder_path.clone(),
                            file_name: file.file_name.clone(),
                        }),
                    })
                    .await?;
                if admitted {
                    tracing::info!("File {} added to conversion queue", path.display());
                }
            }
        }
        Ok(())
    }
}

/// Classifies one directory entry against the naming convention, the
/// sibling artifacts on disk, and the folder policy.
fn classify(folder: &RecordingFolder, file_name: &str) -> Option<PreparedFile> {
    let (stem, extension) = filename::split_name(file_name);
    let is_audio = filename::is_audio_extension(&extension);
    let is_transcript = filename::is_transcript_extension(&extension);
    if !is_audio && !is_transcript {
        return None;
    }

    let path = folder.path.join(file_name);
    let mtime = file_mtime(&path).unwrap_or_else(|e| {
        tracing::warn!("cannot read mtime of {}: {e}", path.display());
        0
    });

    let transcript_exists = is_audio
        && filename::TRANSCRIPT_EXTENSIONS
            .iter()
            .any(|ext| folder.path.join(format!("{stem}.{ext}")).exists());
    let needs_conversion = extension == "wav"
        && !folder.path.join(format!("{stem}.flac")).exists()
        && !folder.ignore_converting;

    Some(PreparedFile {
        folder_id: folder.id,
        file_name: file_name.to_string(),
        extension,
        datetimes: filename::datetime_token(file_name).map(str::to_string),
        mtime,
        is_audio,
        transcript_exists,
        needs_conversion,
        folder_path: folder.path.clone(),
        ignore_transcribing: folder.ignore_transcribing,
    })
}

fn file_mtime(path: &Path) -> std::io::Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::store::QueueKind;

    struct Fixture {
        _dir: tempfile::TempDir,
        rec: PathBuf,
        store: Store,
        _writer: std::thread::JoinHandle<()>,
        transcribe_queue: WorkQueue<KnownFileId>,
        convert_queue: WorkQueue<ConvertItem>,
    }

    async fn fixture(ignore_transcribing: bool, ignore_converting: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let rec = dir.path().join("rec");
        std::fs::create_dir(&rec).unwrap();

        let (store, writer) = Store::open(&dir.path().join("state.db")).unwrap();
        store
            .upsert_folder(
                rec.display().to_string(),
                ignore_transcribing,
                ignore_converting,
            )
            .await
            .unwrap();

        Fixture {
            transcribe_queue: WorkQueue::new(QueueKind::Transcribe, store.clone()),
            convert_queue: WorkQueue::new(QueueKind::Convert, store.clone()),
            rec,
            store,
            _writer: writer,
            _dir: dir,
        }
    }

    fn scanner(fx: &Fixture) -> Scanner {
        Scanner::new(
            fx.store.clone(),
            fx.transcribe_queue.clone(),
            fx.convert_queue.clone(),
            ScannerConfig::default(),
            fx.rec.join("state_backup.json"),
            HashSet::new(),
        )
    }

    #[tokio::test]
    async fn test_fresh_wav_joins_both_queues() {
        let fx = fixture(false, false).await;
        std::fs::write(fx.rec.join("2024-05-06_10-00-00.wav"), b"RIFF").unwrap();

        let mut sc = scanner(&fx);
        assert_eq!(sc.scan_pass().await.unwrap(), 1);

        assert_eq!(fx.transcribe_queue.len(), 1);
        assert_eq!(fx.convert_queue.len(), 1);

        // Second pass sees nothing new.
        assert_eq!(sc.scan_pass().await.unwrap(), 0);
        assert_eq!(fx.transcribe_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_transcript_skips_transcription_only() {
        let fx = fixture(false, false).await;
        std::fs::write(fx.rec.join("2024-05-06_10-00-00.wav"), b"RIFF").unwrap();
        std::fs::write(fx.rec.join("2024-05-06_10-00-00.vtt"), b"WEBVTT").unwrap();

        let mut sc = scanner(&fx);
        sc.scan_pass().await.unwrap();

        assert!(fx.transcribe_queue.is_empty());
        assert_eq!(fx.convert_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_flac_sibling_suppresses_conversion() {
        let fx = fixture(false, false).await;
        std::fs::write(fx.rec.join("2024-05-06_10-00-00.wav"), b"RIFF").unwrap();
        std::fs::write(fx.rec.join("2024-05-06_10-00-00.flac"), b"fLaC").unwrap();

        let mut sc = scanner(&fx);
        sc.scan_pass().await.unwrap();

        assert!(fx.convert_queue.is_empty());
        // The FLAC itself is audio with no transcript: it queues for
        // transcription, as does the WAV.
        assert_eq!(fx.transcribe_queue.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_filename_is_skipped_exactly_once() {
        let fx = fixture(false, false).await;
        std::fs::write(fx.rec.join("badname.wav"), b"RIFF").unwrap();

        let mut sc = scanner(&fx);
        sc.scan_pass().await.unwrap();
        assert!(fx.transcribe_queue.is_empty());
        assert!(fx.convert_queue.is_empty());

        let skips = fx
            .store
            .read(crate::database::store::list_skips)
            .await
            .unwrap();
        assert_eq!(skips.len(), 1);
        assert_eq!(skips[0].1, SkipReason::InvalidFilename);

        // Repeated scans do not duplicate the record or enqueue anything.
        sc.scan_pass().await.unwrap();
        let skips = fx
            .store
            .read(crate::database::store::list_skips)
            .await
            .unwrap();
        assert_eq!(skips.len(), 1);
        assert!(fx.transcribe_queue.is_empty());
    }

    #[tokio::test]
    async fn test_folder_flags_suppress_admission() {
        let fx = fixture(true, true).await;
        std::fs::write(fx.rec.join("2024-05-06_10-00-00.wav"), b"RIFF").unwrap();

        let mut sc = scanner(&fx);
        sc.scan_pass().await.unwrap();
        assert!(fx.transcribe_queue.is_empty());
        assert!(fx.convert_queue.is_empty());

        // Still catalogued as known.
        assert_eq!(fx.store.load_known_set().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_newest_first_admission_order() {
        let fx = fixture(false, false).await;
        for name in [
            "2024-05-06_09-00-00.wav",
            "2024-05-06_11-00-00.wav",
            "2024-05-06_10-00-00.wav",
        ] {
            std::fs::write(fx.rec.join(name), b"RIFF").unwrap();
        }

        let mut sc = scanner(&fx);
        sc.scan_pass().await.unwrap();

        let mut names = Vec::new();
        while let Some(id) = fx.transcribe_queue.try_pop() {
            let file = fx.store.lookup_known_file(id).await.unwrap().unwrap();
            names.push(file.file_name);
        }
        assert_eq!(
            names,
            vec![
                "2024-05-06_11-00-00.wav",
                "2024-05-06_10-00-00.wav",
                "2024-05-06_09-00-00.wav",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_folder_does_not_abort_pass() {
        let fx = fixture(false, false).await;
        fx.store
            .upsert_folder("/does/not/exist".to_string(), false, false)
            .await
            .unwrap();
        std::fs::write(fx.rec.join("2024-05-06_10-00-00.wav"), b"RIFF").unwrap();

        let mut sc = scanner(&fx);
        assert_eq!(sc.scan_pass().await.unwrap(), 1);
        assert_eq!(fx.transcribe_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_transcript_files_are_catalogued() {
        let fx = fixture(false, false).await;
        std::fs::write(fx.rec.join("2024-05-06_10-00-00.txt"), b"hello").unwrap();

        let mut sc = scanner(&fx);
        sc.scan_pass().await.unwrap();

        assert!(fx.transcribe_queue.is_empty());
        let transcripts = fx.store.list_transcript_entries().await.unwrap();
        assert_eq!(transcripts.len(), 1);
    }
}
