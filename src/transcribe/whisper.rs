//! Local in-process Whisper backend.
//!
//! Loads a GGML model once at startup and runs inference synchronously on
//! the blocking pool. Two output modes cover the two local methods: plain
//! text, and per-segment lines with timing bounds.
//!
//! Only WAV input is decoded here; recordings in other containers are
//! routed to the subprocess or WebUI backends.

use std::path::Path;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::{reconstruct_transcript, BackendError, Segment, Transcription};

/// Inference target sample rate.
const SAMPLE_RATE: u32 = 16_000;

pub struct LocalWhisper {
    ctx: WhisperContext,
    model_name: String,
    language: String,
    /// Emit `[<start>s -> <end>s]` segment lines instead of plain text.
    detailed: bool,
}

impl LocalWhisper {
    /// Loads the model, preferring GPU and falling back to CPU.
    pub fn new(
        model_path: &Path,
        model_name: &str,
        language: &str,
        detailed: bool,
    ) -> Result<Self, BackendError> {
        if !model_path.exists() {
            return Err(BackendError::Failed(format!(
                "Whisper model not found: {}",
                model_path.display()
            )));
        }

        let model_str = model_path.to_str().ok_or_else(|| {
            BackendError::Failed(format!(
                "Model path contains invalid UTF-8: {}",
                model_path.display()
            ))
        })?;

        tracing::info!("Loading Whisper model from {}", model_path.display());
        let ctx = Self::load_with_gpu(model_str).or_else(|e| {
            tracing::warn!("GPU initialisation failed: {e}, trying CPU fallback");
            Self::load_with_cpu(model_str)
        })?;

        Ok(Self {
            ctx,
            model_name: model_name.to_string(),
            language: language.to_string(),
            detailed,
        })
    }

    fn load_with_gpu(model_str: &str) -> Result<WhisperContext, BackendError> {
        let mut params = WhisperContextParameters::default();
        params.use_gpu(true);
        WhisperContext::new_with_params(model_str, params)
            .map_err(|e| BackendError::Failed(format!("Failed to load Whisper model: {e:?}")))
    }

    fn load_with_cpu(model_str: &str) -> Result<WhisperContext, BackendError> {
        let mut params = WhisperContextParameters::default();
        params.use_gpu(false);
        let ctx = WhisperContext::new_with_params(model_str, params)
            .map_err(|e| BackendError::Failed(format!("Failed to load Whisper model: {e:?}")))?;
        tracing::info!("Whisper model loaded with CPU backend");
        Ok(ctx)
    }

    /// Synchronous transcription; run this on the blocking pool.
    pub fn transcribe_blocking(&self, audio_path: &Path) -> Result<Transcription, BackendError> {
        let (samples, sample_rate) = load_wav_samples(audio_path)?;
        let audio_seconds = samples.len() as f64 / sample_rate as f64;

        tracing::info!(
            "Loaded audio: {} samples at {}Hz ({:.2}s)",
            samples.len(),
            sample_rate,
            audio_seconds
        );

        if samples.is_empty() {
            return Err(BackendError::AudioShape("audio stream is empty".into()));
        }

        let samples = if sample_rate != SAMPLE_RATE {
            tracing::info!("Resampling from {}Hz to {}Hz", sample_rate, SAMPLE_RATE);
            resample_audio(&samples, sample_rate, SAMPLE_RATE)
        } else {
            samples
        };

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| BackendError::Failed(format!("Failed to create whisper state: {e:?}")))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some(&self.language));
        params.set_translate(false);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state
            .full(params, &samples)
            .map_err(|e| BackendError::Failed(format!("Transcription failed: {e:?}")))?;

        let mut segments = Vec::new();
        for segment in state.as_iter() {
            let Ok(text) = segment.to_str() else { continue };
            segments.push(Segment {
                text: text.trim().to_string(),
                start: Some(segment.start_timestamp() as f64 / 100.0),
                end: Some(segment.end_timestamp() as f64 / 100.0),
                speaker: None,
                confidence: None,
            });
        }

        let text = if self.detailed {
            reconstruct_transcript(&segments)
        } else {
            segments
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string()
        };

        if text.is_empty() {
            return Err(BackendError::Failed("model produced no text".into()));
        }

        Ok(Transcription {
            text,
            duration_seconds: audio_seconds,
            model: Some(self.model_name.clone()),
            language: Some(self.language.clone()),
            segments: if self.detailed { segments } else { Vec::new() },
        })
    }
}

/// Loads mono f32 samples from a WAV file.
fn load_wav_samples(path: &Path) -> Result<(Vec<f32>, u32), BackendError> {
    let reader = hound::WavReader::open(path).map_err(|e| match e {
        hound::Error::IoError(io) => BackendError::AudioUnreadable(format!(
            "{}: {io}",
            path.display()
        )),
        other => BackendError::AudioShape(other.to_string()),
    })?;
    let spec = reader.spec();
    let sample_rate = spec.sample_rate;

    let samples: Vec<f32> = if spec.bits_per_sample == 16 {
        reader
            .into_samples::<i16>()
            .filter_map(|s| s.ok())
            .map(|s| s as f32 / 32768.0)
            .collect()
    } else if spec.bits_per_sample == 32 && spec.sample_format == hound::SampleFormat::Float {
        reader.into_samples::<f32>().filter_map(|s| s.ok()).collect()
    } else {
        return Err(BackendError::AudioShape(format!(
            "unsupported audio format: {} bits, {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    };

    // Mix to mono if stereo
    let mono_samples = if spec.channels == 2 {
        samples
            .chunks(2)
            .map(|c| (c[0] + c.get(1).copied().unwrap_or(0.0)) / 2.0)
            .collect()
    } else if spec.channels == 1 {
        samples
    } else {
        return Err(BackendError::AudioShape(format!(
            "unsupported channel count: {}",
            spec.channels
        )));
    };

    Ok((mono_samples, sample_rate))
}

/// Simple linear resampling (for basic sample rate conversion)
fn resample_audio(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 * ratio;
        let idx = src_idx as usize;
        let frac = src_idx - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac as f32) + samples[idx + 1] * frac as f32
        } else if idx < samples.len() {
            samples[idx]
        } else {
            0.0
        };

        output.push(sample);
    }

    output
}
