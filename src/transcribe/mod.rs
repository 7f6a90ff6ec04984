//! Transcription stage.
//!
//! Consumes the transcribe queue, dispatches each recording to the
//! configured backend, writes the transcript artifact next to the audio,
//! and hands the recording off to the convert queue. Backends share one
//! result contract; failures map onto durable skip reasons.

pub mod cli;
pub mod envelope;
pub mod webui;
#[cfg(feature = "local-whisper")]
pub mod whisper;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::config::{TranscriptionConfig, TranscriptionMethod, WebuiConfig};
use crate::coordinator::StageGate;
use crate::database::store::{KnownFileId, SkipReason, StoreError};
use crate::database::writer::Store;
use crate::filename;
use crate::governor::{CpuMonitor, QueryQueue};
use crate::queue::{ConvertHint, ConvertItem, WorkQueue};

/// One recognised span, with timing bounds where the backend provides
/// them. Serialised into the execution envelope as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Uniform result contract across backends.
#[derive(Debug, Clone, Default)]
pub struct Transcription {
    pub text: String,
    pub duration_seconds: f64,
    pub model: Option<String>,
    pub language: Option<String>,
    pub segments: Vec<Segment>,
}

/// Canonical transcript reconstruction: one line per segment,
/// `[<start>s -> <end>s] <text>` with two-decimal bounds; segments without
/// bounds render as bare text.
pub fn reconstruct_transcript(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match (segment.start, segment.end) {
            (Some(start), Some(end)) => {
                out.push_str(&format!("[{start:.2}s -> {end:.2}s] {}\n", segment.text));
            }
            _ => {
                out.push_str(&segment.text);
                out.push('\n');
            }
        }
    }
    out.trim().to_string()
}

/// Backend failure classification.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Webui(#[from] webui::WebuiError),

    #[error("audio unreadable: {0}")]
    AudioUnreadable(String),

    #[error("incorrect audio shape: {0}")]
    AudioShape(String),

    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    /// The durable reason code this failure is recorded under.
    pub fn skip_reason(&self) -> SkipReason {
        match self {
            BackendError::Webui(webui::WebuiError::AudioRead { .. }) => {
                SkipReason::TranscriptionFailed
            }
            BackendError::Webui(e) => SkipReason::WebuiError(e.to_string()),
            BackendError::AudioShape(_) => SkipReason::IncorrectAudioShape,
            BackendError::AudioUnreadable(_) | BackendError::Failed(_) => {
                SkipReason::TranscriptionFailed
            }
        }
    }
}

/// Concrete transcription backends, selected by configuration.
pub enum Backend {
    #[cfg(feature = "local-whisper")]
    Local(Arc<whisper::LocalWhisper>),
    Cli(cli::CliTranscriber),
    Webui(webui::WebuiBackend),
}

impl Backend {
    /// Builds the backend named by `transcription.method`.
    pub fn from_config(config: &TranscriptionConfig) -> Result<Self, BackendError> {
        match config.method {
            TranscriptionMethod::PythonWhisper | TranscriptionMethod::Ctranslate2 => {
                #[cfg(feature = "local-whisper")]
                {
                    let model_path = config.model_path.as_deref().ok_or_else(|| {
                        BackendError::Failed(format!(
                            "transcription.model_path must point at a GGML model for method {}",
                            config.method
                        ))
                    })?;
                    let detailed = config.method == TranscriptionMethod::Ctranslate2;
                    Ok(Backend::Local(Arc::new(whisper::LocalWhisper::new(
                        model_path,
                        &config.model,
                        &config.language,
                        detailed,
                    )?)))
                }
                #[cfg(not(feature = "local-whisper"))]
                {
                    Err(BackendError::Failed(format!(
                        "built without the local-whisper feature; method {} needs \
                         ctranslate2_nonpythonic or webui instead",
                        config.method
                    )))
                }
            }
            TranscriptionMethod::Ctranslate2Nonpythonic => Ok(Backend::Cli(
                cli::CliTranscriber::new(config.model.clone(), config.language.clone()),
            )),
            TranscriptionMethod::Webui => {
                Ok(Backend::Webui(webui::WebuiBackend::new(config.webui.clone())?))
            }
        }
    }

    /// Remote backends are paced through the query queue and may drain
    /// ready batches.
    pub fn is_remote(&self) -> bool {
        matches!(self, Backend::Webui(_))
    }

    pub async fn transcribe(&self, audio_path: &Path) -> Result<Transcription, BackendError> {
        match self {
            #[cfg(feature = "local-whisper")]
            Backend::Local(local) => {
                let local = Arc::clone(local);
                let path = audio_path.to_path_buf();
                tokio::task::spawn_blocking(move || local.transcribe_blocking(&path))
                    .await
                    .map_err(|e| BackendError::Failed(format!("inference task aborted: {e}")))?
            }
            Backend::Cli(cli) => cli.transcribe(audio_path).await,
            Backend::Webui(webui) => Ok(webui.transcribe(audio_path).await?),
        }
    }
}

/// Rolling completion counters for observability: completions in the last
/// hour and the last minute.
#[derive(Debug, Default)]
pub struct CompletionRates {
    events: VecDeque<Instant>,
}

impl CompletionRates {
    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    fn record_at(&mut self, at: Instant) {
        self.events.push_back(at);
        if let Some(horizon) = at.checked_sub(Duration::from_secs(3600)) {
            while self.events.front().is_some_and(|t| *t < horizon) {
                self.events.pop_front();
            }
        }
    }

    pub fn per_hour(&self) -> usize {
        self.events.len()
    }

    pub fn per_minute(&self) -> usize {
        match Instant::now().checked_sub(Duration::from_secs(60)) {
            Some(cutoff) => self.events.iter().filter(|t| **t >= cutoff).count(),
            None => self.events.len(),
        }
    }
}

/// The transcription worker.
pub struct Transcriber {
    store: Store,
    transcribe_queue: WorkQueue<KnownFileId>,
    convert_queue: WorkQueue<ConvertItem>,
    gate: StageGate,
    backend: Backend,
    query_queue: QueryQueue,
    cpu: Arc<CpuMonitor>,
    webui_config: WebuiConfig,
    rates: CompletionRates,
}

impl Transcriber {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        transcribe_queue: WorkQueue<KnownFileId>,
        convert_queue: WorkQueue<ConvertItem>,
        gate: StageGate,
        backend: Backend,
        query_queue: QueryQueue,
        cpu: Arc<CpuMonitor>,
        webui_config: WebuiConfig,
    ) -> Self {
        Self {
            store,
            transcribe_queue,
            convert_queue,
            gate,
            backend,
            query_queue,
            cpu,
            webui_config,
            rates: CompletionRates::default(),
        }
    }

    /// Worker loop: pop, transcribe, persist, hand off. Remote backends
    /// drain every ready item per wakeup so newly appended work joins the
    /// batch immediately.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let first = tokio::select! {
                _ = shutdown.recv() => break,
                id = self.transcribe_queue.pop() => id,
            };

            self.gate.begin_transcribing();
            let mut current = Some(first);
            while let Some(id) = current {
                if let Err(e) = self.process_item(id).await {
                    tracing::error!("state store error while transcribing: {e}");
                }
                current = if self.backend.is_remote() {
                    self.transcribe_queue.try_pop()
                } else {
                    None
                };
                if current.is_some() {
                    self.gate.begin_transcribing();
                }
            }

            let drained = self.transcribe_queue.is_empty();
            self.gate.finish_transcribing(drained);
            if drained {
                tracing::info!("All transcription tasks completed, entering housekeeping mode.");
            } else {
                tracing::info!(
                    "{} transcription tasks remaining.",
                    self.transcribe_queue.len()
                );
            }
        }
        tracing::info!("transcriber stopped");
    }

    async fn process_item(&mut self, id: KnownFileId) -> Result<(), StoreError> {
        let started = Instant::now();

        let Some(file) = self.store.lookup_known_file(id).await? else {
            tracing::error!("known file id {id} is not in the store; dropping queue item");
            self.transcribe_queue.ack(id).await?;
            return Ok(());
        };
        let path = file.full_path();

        if !filename::is_audio_extension(&file.extension) {
            tracing::info!("Skipping non-audio file: {}", path.display());
            self.transcribe_queue.ack(id).await?;
            return Ok(());
        }

        // An operator may have excluded the file after it was admitted.
        if self.store.is_skipped(id).await? {
            tracing::info!("Skipping excluded file: {}", path.display());
            self.transcribe_queue.ack(id).await?;
            return Ok(());
        }

        tracing::info!("Starting transcription for {}", path.display());
        match self.dispatch(&path).await {
            Ok(result) => {
                let transcript_path = path.with_extension("txt");
                if let Err(e) = self.write_artifacts(&path, &transcript_path, &result).await {
                    tracing::error!(
                        "Error writing transcription output for {}: {e} \
                         (transcription_output_error)",
                        path.display()
                    );
                    self.store
                        .record_skip(id, SkipReason::TranscriptionOutputError)
                        .await?;
                    self.transcribe_queue.ack(id).await?;
                    return Ok(());
                }

                self.rates.record();
                let elapsed = started.elapsed().as_secs_f64();
                let speedup = if elapsed > 0.0 {
                    result.duration_seconds / elapsed
                } else {
                    0.0
                };

                self.convert_queue
                    .enqueue(ConvertItem {
                        id,
                        hint: Some(ConvertHint {
                            folder_path: file.folder_path.clone(),
                            file_name: file.file_name.clone(),
                        }),
                    })
                    .await?;
                self.transcribe_queue.ack(id).await?;

                tracing::info!(
                    "File {} transcribed in {elapsed:.2}s (x{speedup:.2}). \
                     {} waiting for conversion, {} left to transcribe. \
                     Rates: {} files/hour, {} files/minute.",
                    path.display(),
                    self.convert_queue.len(),
                    self.transcribe_queue.len(),
                    self.rates.per_hour(),
                    self.rates.per_minute(),
                );
            }
            Err(err) => {
                let reason = err.skip_reason();
                tracing::error!(
                    "Transcription failed for {}: {err} ({reason})",
                    path.display()
                );
                self.store.record_skip(id, reason).await?;
                self.transcribe_queue.ack(id).await?;
            }
        }
        Ok(())
    }

    /// Remote calls are serialised through the query queue; local work
    /// waits for CPU headroom first.
    async fn dispatch(&self, path: &Path) -> Result<Transcription, BackendError> {
        match &self.backend {
            Backend::Webui(client) => {
                let client = client.clone();
                let path = path.to_path_buf();
                self.query_queue
                    .run(async move { client.transcribe(&path).await })
                    .await
                    .map_err(|e| BackendError::Failed(e.to_string()))?
                    .map_err(BackendError::from)
            }
            other => {
                self.cpu.wait_for_safe_usage().await;
                other.transcribe(path).await
            }
        }
    }

    async fn write_artifacts(
        &self,
        audio_path: &Path,
        transcript_path: &Path,
        result: &Transcription,
    ) -> std::io::Result<()> {
        tokio::fs::write(transcript_path, result.text.as_bytes()).await?;
        tracing::info!("Transcript written to {}", transcript_path.display());

        if self.backend.is_remote() && self.webui_config.emit_envelope {
            let transcription = result.clone();
            let audio = audio_path.to_path_buf();
            let destination = envelope::envelope_path(
                transcript_path,
                self.webui_config.envelope_dir.as_deref(),
            );
            tokio::task::spawn_blocking(move || {
                let payload = envelope::build_envelope(&transcription, Some(&audio))?;
                envelope::write_envelope(&destination, &payload)
            })
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;
        }
        Ok(())
    }
}
