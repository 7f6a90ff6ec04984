//! Service wiring and lifecycle.
//!
//! Builds the fixed worker set — scanner, transcriber, converter, state
//! writer, query queue — over one shared store and stage gate, runs the
//! housekeeping loop, and coordinates the shutdown drain: stop admission,
//! give in-flight work a bounded grace period, export the state snapshot,
//! stop the writer.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::convert::Converter;
use crate::coordinator::StageGate;
use crate::database::store::{KnownFileId, QueueKind};
use crate::database::writer::Store;
use crate::governor::{CpuMonitor, FixedRateLimiter, QueryQueue};
use crate::matcher;
use crate::queue::{ConvertItem, WorkQueue};
use crate::scanner::Scanner;
use crate::transcribe::{Backend, Transcriber};

/// Grace period for in-flight work once shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Housekeeping cadence.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

pub struct Service {
    config: Config,
    store: Store,
    writer_handle: std::thread::JoinHandle<()>,
    transcribe_queue: WorkQueue<KnownFileId>,
    convert_queue: WorkQueue<ConvertItem>,
    gate: StageGate,
    shutdown_tx: broadcast::Sender<()>,
    snapshot_path: PathBuf,
}

impl Service {
    /// Opens the store, imports configured folders, recovers state, and
    /// rehydrates the work queues.
    pub async fn new(config: Config) -> Result<Self> {
        let db_path = config.database_path()?;
        let (store, writer_handle) =
            Store::open(&db_path).context("failed to open the state store")?;
        let snapshot_path = config.snapshot_path(&db_path);

        for folder in &config.recordings_folders {
            store
                .upsert_folder(
                    folder.path.clone(),
                    folder.ignore_transcribing,
                    folder.ignore_converting,
                )
                .await
                .with_context(|| format!("failed to register folder {}", folder.path))?;
        }
        let folders = store.list_folders().await?;
        if folders.is_empty() {
            bail!(
                "no recording folders configured; add recordings_folders to the config \
                 or pass --data-dir"
            );
        }
        for folder in &folders {
            tracing::info!(
                "watching {} (ignore_transcribing={}, ignore_converting={})",
                folder.path.display(),
                folder.ignore_transcribing,
                folder.ignore_converting
            );
        }

        // Cold start: an empty catalog with a surviving snapshot artifact
        // means the database is fresh; replay the snapshot.
        if store.load_known_set().await?.is_empty() && snapshot_path.exists() {
            match store.import_snapshot(snapshot_path.clone()).await {
                Ok(snapshot) => tracing::info!(
                    "recovered snapshot: {} known files, {} to transcribe, {} to convert, \
                     {} skipped",
                    snapshot.known_files.len(),
                    snapshot.transcribe_queue.len(),
                    snapshot.convert_queue.len(),
                    snapshot.skip_files.len()
                ),
                Err(e) => tracing::warn!("snapshot import failed: {e}"),
            }
        }

        let transcribe_queue: WorkQueue<KnownFileId> =
            WorkQueue::new(QueueKind::Transcribe, store.clone());
        let convert_queue: WorkQueue<ConvertItem> =
            WorkQueue::new(QueueKind::Convert, store.clone());

        let pending_transcribe = store.load_queue(QueueKind::Transcribe).await?;
        let pending_convert = store.load_queue(QueueKind::Convert).await?;
        if !pending_transcribe.is_empty() || !pending_convert.is_empty() {
            tracing::info!(
                "rehydrated queues: {} to transcribe, {} to convert",
                pending_transcribe.len(),
                pending_convert.len()
            );
        }
        transcribe_queue.rehydrate(pending_transcribe);
        convert_queue.rehydrate(
            pending_convert
                .into_iter()
                .map(ConvertItem::bare)
                .collect(),
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            store,
            writer_handle,
            transcribe_queue,
            convert_queue,
            gate: StageGate::new(),
            shutdown_tx,
            snapshot_path,
        })
    }

    /// Runs the pipeline until an OS shutdown signal arrives, then drains
    /// and persists. Returns once state is safely exported.
    pub async fn run(self) -> Result<()> {
        let backend = Backend::from_config(&self.config.transcription)
            .map_err(|e| anyhow::anyhow!("transcription backend init failed: {e}"))?;
        tracing::info!(
            "transcription backend: {}",
            self.config.transcription.method
        );

        let governor = &self.config.governor;
        let cpu = Arc::new(CpuMonitor::new(
            governor.cpu_max_percent,
            Duration::from_secs_f64(governor.cpu_check_interval_secs),
        ));
        let (query_queue, query_handle) = QueryQueue::start(
            FixedRateLimiter::new(Duration::from_secs_f64(governor.outbound_interval_secs)),
            CpuMonitor::new(
                governor.cpu_max_percent,
                Duration::from_secs_f64(governor.cpu_check_interval_secs),
            ),
        );

        let known: HashSet<_> = self.store.load_known_set().await?.into_iter().collect();
        let scanner = Scanner::new(
            self.store.clone(),
            self.transcribe_queue.clone(),
            self.convert_queue.clone(),
            self.config.scanner.clone(),
            self.snapshot_path.clone(),
            known,
        );
        let transcriber = Transcriber::new(
            self.store.clone(),
            self.transcribe_queue.clone(),
            self.convert_queue.clone(),
            self.gate.clone(),
            backend,
            query_queue.clone(),
            Arc::clone(&cpu),
            self.config.transcription.webui.clone(),
        );
        let converter = Converter::new(
            self.store.clone(),
            self.convert_queue.clone(),
            self.gate.clone(),
            self.config.converter.clone(),
        );

        tracing::info!("Starting scanner worker...");
        let scanner_task = tokio::spawn(scanner.run(self.shutdown_tx.subscribe()));
        tracing::info!("Starting transcribe worker...");
        let transcriber_task = tokio::spawn(transcriber.run(self.shutdown_tx.subscribe()));
        tracing::info!("Starting convert worker...");
        let converter_task = tokio::spawn(converter.run(self.shutdown_tx.subscribe()));

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received interrupt signal");
                    break;
                }
                _ = wait_for_terminate() => {
                    tracing::info!("Received terminate signal");
                    break;
                }
                _ = tokio::time::sleep(HOUSEKEEPING_INTERVAL) => {
                    self.housekeeping().await;
                }
            }
        }

        tracing::info!(
            "Shutdown signal received. Exporting queues, known files, and skip files..."
        );
        let _ = self.shutdown_tx.send(());

        let drain = async {
            let _ = scanner_task.await;
            let _ = transcriber_task.await;
            let _ = converter_task.await;
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!(
                "workers still busy after {DRAIN_TIMEOUT:?}; exporting state as-is"
            );
        }
        drop(query_queue);
        let _ = tokio::time::timeout(Duration::from_secs(1), query_handle).await;

        // Anything still leased goes back at the head so a partially
        // processed item survives the restart.
        let mut qt = self.transcribe_queue.leased_ids();
        qt.extend(self.transcribe_queue.snapshot_ids());
        let mut qc = self.convert_queue.leased_ids();
        qc.extend(self.convert_queue.snapshot_ids());

        self.store
            .export_snapshot(qt, qc, self.snapshot_path.clone())
            .await
            .context("final snapshot export failed")?;

        // Release every store handle so the writer thread can stop.
        let Service {
            store,
            writer_handle,
            transcribe_queue,
            convert_queue,
            ..
        } = self;
        drop(transcribe_queue);
        drop(convert_queue);
        drop(store);
        // A timed-out worker may still hold a store handle; bound the wait
        // rather than hang the exit.
        let join = tokio::task::spawn_blocking(move || writer_handle.join());
        let _ = tokio::time::timeout(Duration::from_secs(5), join).await;

        tracing::info!("shutdown complete");
        Ok(())
    }

    /// Periodic pass: visibility logging, opening the conversion gate when
    /// transcription is idle, and the audio/transcript pairing sweep.
    async fn housekeeping(&self) {
        tracing::debug!(
            "Main loop: state={:?}, {} to transcribe, {} to convert",
            self.gate.state(),
            self.transcribe_queue.len(),
            self.convert_queue.len()
        );

        let transcription_idle =
            self.transcribe_queue.is_empty() && !self.gate.transcribing_active();
        if transcription_idle && !self.convert_queue.is_empty() {
            self.gate.open_conversion_gate();
        }

        if transcription_idle && self.convert_queue.is_empty() {
            if let Err(e) = matcher::run_matching_pass(&self.store).await {
                tracing::error!("matching pass failed: {e}");
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::warn!("cannot install SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_terminate() {
    std::future::pending::<()>().await;
}
