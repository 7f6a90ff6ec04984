//! WAV→FLAC conversion stage.
//!
//! Consumes the convert queue strictly behind the transcription gate,
//! resolves each recording's location (payload hint, then the store, then
//! a folder scan), and re-encodes losslessly through the external media
//! tool. Conversion never runs while transcription is active; when the
//! transcriber stays busy past the retry allowance the item is pushed
//! back for a later cycle.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex};

use crate::config::ConverterConfig;
use crate::coordinator::StageGate;
use crate::database::store::{SkipReason, StoreError};
use crate::database::writer::Store;
use crate::queue::{ConvertItem, WorkQueue};

pub struct Converter {
    store: Store,
    convert_queue: WorkQueue<ConvertItem>,
    gate: StageGate,
    config: ConverterConfig,
    /// Serialises the external tool invocation.
    lock: Mutex<()>,
}

impl Converter {
    pub fn new(
        store: Store,
        convert_queue: WorkQueue<ConvertItem>,
        gate: StageGate,
        config: ConverterConfig,
    ) -> Self {
        Self {
            store,
            convert_queue,
            gate,
            config,
            lock: Mutex::new(()),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = self.gate.wait_transcription_complete() => {}
            }
            let item = tokio::select! {
                _ = shutdown.recv() => break,
                item = self.convert_queue.pop() => item,
            };
            if let Err(e) = self.handle_item(item).await {
                tracing::error!("state store error while converting: {e}");
            }
        }
        tracing::info!("converter stopped");
    }

    async fn handle_item(&self, item: ConvertItem) -> Result<(), StoreError> {
        // Transcription reclaimed the CPU after the gate opened: wait it
        // out, then give the item back for a later cycle if it persists.
        let mut attempts = 0;
        while self.gate.transcribing_active() && attempts < self.config.busy_attempts {
            attempts += 1;
            tracing::warn!(
                "Waiting to convert item {} as transcribing is active. Attempt {attempts}/{}",
                item.id,
                self.config.busy_attempts
            );
            tokio::time::sleep(Duration::from_secs(self.config.busy_pause_secs)).await;
        }
        if self.gate.transcribing_active() {
            tracing::error!(
                "Conversion skipped for item {} after {attempts} attempts as transcribing \
                 is still active.",
                item.id
            );
            self.convert_queue.requeue(item);
            return Ok(());
        }

        self.gate.begin_converting();
        let result = self.convert(&item).await;
        self.gate.finish_converting(self.convert_queue.is_empty());
        if self.convert_queue.is_empty() {
            tracing::info!("All conversion tasks completed, entering housekeeping mode.");
        }
        result
    }

    async fn convert(&self, item: &ConvertItem) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;

        let Some(input) = self.resolve_input(item).await? else {
            tracing::error!(
                "File paths not found for item {}. Skipping conversion.",
                item.id
            );
            self.convert_queue.ack(item.id).await?;
            return Ok(());
        };

        if !input
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
        {
            tracing::info!("Skipping non-WAV file: {}", input.display());
            self.convert_queue.ack(item.id).await?;
            return Ok(());
        }

        let output = input.with_extension("flac");
        if output.exists() {
            tracing::debug!(
                "Skipping conversion for {}: FLAC already exists.",
                input.display()
            );
            self.convert_queue.ack(item.id).await?;
            return Ok(());
        }

        tracing::info!("Starting conversion for {}.", input.display());
        match run_media_tool(&self.config.media_tool, &input, &output).await {
            Ok(()) => {
                let mtime = file_mtime(&output).unwrap_or_else(|e| {
                    tracing::warn!("cannot read mtime of {}: {e}", output.display());
                    0
                });
                self.store.note_audio(item.id, mtime).await?;
                self.convert_queue.ack(item.id).await?;
                tracing::info!("Conversion completed for {}.", input.display());
            }
            Err(message) => {
                tracing::error!(
                    "Failed to convert {} to FLAC: {message} (conversion_failed)",
                    input.display()
                );
                self.store
                    .record_skip(item.id, SkipReason::ConversionFailed)
                    .await?;
                self.convert_queue.ack(item.id).await?;
            }
        }
        Ok(())
    }

    /// Payload hint first, then the store, then a scan of the watched
    /// folders for a matching basename.
    async fn resolve_input(&self, item: &ConvertItem) -> Result<Option<PathBuf>, StoreError> {
        if let Some(hint) = &item.hint {
            let path = hint.folder_path.join(&hint.file_name);
            if path.exists() {
                return Ok(Some(path));
            }
        }

        let file_name = match self.store.lookup_known_file(item.id).await? {
            Some(file) => {
                let path = file.full_path();
                if path.exists() {
                    return Ok(Some(path));
                }
                file.file_name
            }
            None => match &item.hint {
                Some(hint) => hint.file_name.clone(),
                None => return Ok(None),
            },
        };

        for folder in self.store.list_folders().await? {
            let candidate = folder.path.join(&file_name);
            if candidate.exists() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

async fn run_media_tool(tool: &str, input: &Path, output: &Path) -> Result<(), String> {
    let result = Command::new(tool)
        .arg("-i")
        .arg(input)
        .arg("-c:a")
        .arg("flac")
        .arg(output)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| format!("failed to run {tool}: {e}"))?;

    if !result.stderr.is_empty() {
        tracing::debug!(
            "{tool} stderr: {}",
            String::from_utf8_lossy(&result.stderr).trim_end()
        );
    }
    if !result.status.success() {
        return Err(format!("{tool} exited with {}", result.status));
    }
    Ok(())
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
    use crate::queue::ConvertHint;

    struct Fixture {
        _dir: tempfile::TempDir,
        rec: PathBuf,
        store: Store,
        _writer: std::thread::JoinHandle<()>,
        queue: WorkQueue<ConvertItem>,
        gate: StageGate,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let rec = dir.path().join("rec");
        std::fs::create_dir(&rec).unwrap();
        let (store, writer) = Store::open(&dir.path().join("state.db")).unwrap();
        store
            .upsert_folder(rec.display().to_string(), false, false)
            .await
            .unwrap();
        Fixture {
            queue: WorkQueue::new(QueueKind::Convert, store.clone()),
            gate: StageGate::new(),
            rec,
            store,
            _writer: writer,
            _dir: dir,
        }
    }

    async fn seed_wav(fx: &Fixture, name: &str) -> ConvertItem {
        std::fs::write(fx.rec.join(name), b"RIFF").unwrap();
        let id = fx
            .store
            .upsert_known_file(
                1,
                name.to_string(),
                "wav".to_string(),
                crate::filename::datetime_token(name).map(str::to_string),
            )
            .await
            .unwrap();
        let item = ConvertItem {
            id,
            hint: Some(ConvertHint {
                folder_path: fx.rec.clone(),
                file_name: name.to_string(),
            }),
        };
        fx.queue.enqueue(item.clone()).await.unwrap();
        item
    }

    fn converter(fx: &Fixture, media_tool: &str) -> Converter {
        let config = ConverterConfig {
            media_tool: media_tool.to_string(),
            busy_pause_secs: 0,
            busy_attempts: 2,
        };
        Converter::new(fx.store.clone(), fx.queue.clone(), fx.gate.clone(), config)
    }

    #[tokio::test]
    async fn test_existing_flac_short_circuits_without_running_tool() {
        let fx = fixture().await;
        let item = seed_wav(&fx, "2024-05-06_10-00-00.wav").await;
        std::fs::write(fx.rec.join("2024-05-06_10-00-00.flac"), b"fLaC").unwrap();

        // A failing tool proves it is never invoked.
        let cv = converter(&fx, "false");
        let popped = fx.queue.pop().await;
        cv.handle_item(popped).await.unwrap();

        assert!(!fx.store.is_skipped(item.id).await.unwrap());
        assert!(fx
            .store
            .load_queue(QueueKind::Convert)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_tool_failure_records_conversion_failed() {
        let fx = fixture().await;
        let item = seed_wav(&fx, "2024-05-06_10-00-00.wav").await;

        let cv = converter(&fx, "false");
        let popped = fx.queue.pop().await;
        cv.handle_item(popped).await.unwrap();

        assert!(fx.store.is_skipped(item.id).await.unwrap());
        let skips = fx.store.read(crate::database::store::list_skips).await.unwrap();
        assert_eq!(skips[0].1, SkipReason::ConversionFailed);
    }

    #[tokio::test]
    async fn test_tool_success_acks_and_indexes() {
        let fx = fixture().await;
        let item = seed_wav(&fx, "2024-05-06_10-00-00.wav").await;

        // `true` swallows the fixed argument vector and exits cleanly.
        let cv = converter(&fx, "true");
        let popped = fx.queue.pop().await;
        cv.handle_item(popped).await.unwrap();

        assert!(!fx.store.is_skipped(item.id).await.unwrap());
        assert!(fx
            .store
            .load_queue(QueueKind::Convert)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_non_wav_items_are_acked_through() {
        let fx = fixture().await;
        let name = "2024-05-06_10-00-00.mp3";
        std::fs::write(fx.rec.join(name), b"ID3").unwrap();
        let id = fx
            .store
            .upsert_known_file(
                1,
                name.to_string(),
                "mp3".to_string(),
                crate::filename::datetime_token(name).map(str::to_string),
            )
            .await
            .unwrap();
        let item = ConvertItem {
            id,
            hint: Some(ConvertHint {
                folder_path: fx.rec.clone(),
                file_name: name.to_string(),
            }),
        };
        fx.queue.enqueue(item).await.unwrap();

        let cv = converter(&fx, "false");
        let popped = fx.queue.pop().await;
        cv.handle_item(popped).await.unwrap();

        assert!(!fx.store.is_skipped(id).await.unwrap());
        assert!(fx
            .store
            .load_queue(QueueKind::Convert)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_active_transcription_pushes_item_back() {
        let fx = fixture().await;
        seed_wav(&fx, "2024-05-06_10-00-00.wav").await;
        fx.gate.begin_transcribing();

        let cv = converter(&fx, "false");
        let popped = fx.queue.pop().await;
        cv.handle_item(popped).await.unwrap();

        // Re-queued, not skipped, durable row intact.
        assert_eq!(fx.queue.len(), 1);
        assert_eq!(fx.store.load_queue(QueueKind::Convert).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_path_resolution_falls_back_to_folder_scan() {
        let fx = fixture().await;
        let name = "2024-05-06_10-00-00.wav";
        std::fs::write(fx.rec.join(name), b"RIFF").unwrap();
        let id = fx
            .store
            .upsert_known_file(
                1,
                name.to_string(),
                "wav".to_string(),
                crate::filename::datetime_token(name).map(str::to_string),
            )
            .await
            .unwrap();
        // Hint pointing somewhere stale; resolution must still find it.
        let item = ConvertItem {
            id,
            hint: Some(ConvertHint {
                folder_path: PathBuf::from("/stale"),
                file_name: name.to_string(),
            }),
        };

        let cv = converter(&fx, "true");
        let resolved = cv.resolve_input(&item).await.unwrap().unwrap();
        assert_eq!(resolved, fx.rec.join(name));
    }
}
