//! Remote WhisperX-WebUI transcription adapter.
//!
//! Posts the audio file to a Gradio-style endpoint as multipart form data
//! (field `files`), with backend options flattened into plain form fields
//! — nested objects and arrays are JSON-encoded per field, nulls dropped.
//! The response comes back as `{text, duration?}`, a `[text, duration]`
//! pair, or a `{segments: [...]}` structure from which the canonical
//! transcript is reconstructed.

use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use super::{reconstruct_transcript, Segment, Transcription};
use crate::config::WebuiConfig;

/// Remote backend failure taxonomy. The display string becomes the
/// `webui_error:<detail>` skip-reason detail.
#[derive(Debug, thiserror::Error)]
pub enum WebuiError {
    #[error("WebUI base_url is not configured")]
    MissingBaseUrl,

    #[error("{0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("empty transcription result")]
    EmptyResult,

    #[error("failed to read audio {path}: {message}")]
    AudioRead { path: String, message: String },
}

/// HTTP client owning the WebUI wire contract and option flattening.
#[derive(Clone)]
pub struct WebuiBackend {
    config: WebuiConfig,
    client: reqwest::Client,
}

impl WebuiBackend {
    pub fn new(config: WebuiConfig) -> Result<Self, WebuiError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(Duration::from_secs_f64(timeout));
        }
        if !config.verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| WebuiError::Transport(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let path = &self.config.transcribe_path;
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    /// Uploads the recording and returns the uniform transcription result.
    pub async fn transcribe(&self, audio_path: &Path) -> Result<Transcription, WebuiError> {
        if self.config.base_url.trim().is_empty() {
            return Err(WebuiError::MissingBaseUrl);
        }

        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let bytes = tokio::fs::read(audio_path)
            .await
            .map_err(|e| WebuiError::AudioRead {
                path: audio_path.display().to_string(),
                message: e.to_string(),
            })?;

        let (_, extension) = crate::filename::split_name(&file_name);
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for_extension(&extension))
            .map_err(|e| WebuiError::Transport(e.to_string()))?;

        let mut form = Form::new().part("files", part);
        for (key, value) in flatten_options(&self.config.options) {
            form = form.text(key, value);
        }

        let mut request = self.client.post(self.endpoint()).multipart(form);
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }
        if let Some(api_key) = &self.config.api_key {
            let has_authorization = self
                .config
                .headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("authorization"));
            if !has_authorization {
                request = request.bearer_auth(api_key);
            }
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                WebuiError::Timeout
            } else {
                WebuiError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(WebuiError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| WebuiError::UnexpectedResponse(e.to_string()))?;
        parse_response(body)
    }
}

/// Flattens the configured options into form fields: scalars verbatim,
/// objects/arrays JSON-encoded, nulls dropped.
pub fn flatten_options(
    options: &serde_json::Map<String, Value>,
) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    for (key, value) in options {
        let encoded = match value {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => serde_json::to_string(other).unwrap_or_default(),
        };
        fields.push((key.clone(), encoded));
    }
    fields
}

/// Parses the three accepted response shapes into the uniform result.
pub fn parse_response(body: Value) -> Result<Transcription, WebuiError> {
    let mut result = Transcription::default();

    match &body {
        Value::Object(map) => {
            if let Some(model) = map.get("model").and_then(Value::as_str) {
                result.model = Some(model.to_string());
            }
            if let Some(language) = map.get("language").and_then(Value::as_str) {
                result.language = Some(language.to_string());
            }
            if let Some(segments) = map.get("segments").and_then(Value::as_array) {
                result.segments = segments
                    .iter()
                    .filter_map(|s| serde_json::from_value::<Segment>(s.clone()).ok())
                    .collect();
            }

            if let Some(text) = map.get("text").and_then(Value::as_str) {
                result.text = text.to_string();
                result.duration_seconds =
                    map.get("duration").and_then(Value::as_f64).unwrap_or(0.0);
            } else if !result.segments.is_empty() {
                result.text = reconstruct_transcript(&result.segments);
                result.duration_seconds = segments_duration(&result.segments);
            } else {
                return Err(WebuiError::UnexpectedResponse(truncate(&body)));
            }
        }
        Value::Array(items) => {
            let text = items
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| WebuiError::UnexpectedResponse(truncate(&body)))?;
            result.text = text.to_string();
            result.duration_seconds = items.get(1).and_then(Value::as_f64).unwrap_or(0.0);
        }
        _ => return Err(WebuiError::UnexpectedResponse(truncate(&body))),
    }

    if result.text.trim().is_empty() {
        return Err(WebuiError::EmptyResult);
    }
    Ok(result)
}

fn segments_duration(segments: &[Segment]) -> f64 {
    segments
        .iter()
        .filter_map(|s| Some(s.end? - s.start?))
        .sum()
}

fn truncate(value: &Value) -> String {
    let mut text = value.to_string();
    if text.len() > 200 {
        text.truncate(200);
        text.push('…');
    }
    text
}

fn mime_for_extension(extension: &str) -> &'static str {
    match extension {
        "wav" => "audio/x-wav",
        "flac" => "audio/flac",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "amr" => "audio/amr",
        _ => "application/octet-stream",
    }
}
