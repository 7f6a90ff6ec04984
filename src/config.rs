//! Configuration management.
//!
//! A single JSON document controls the pipeline. Its location comes from
//! the `TIRCORDER_CONFIG_PATH` environment variable, defaulting to
//! `~/.tircorder_config.json`. Every field has a default, so a missing
//! document at the default location simply yields the default
//! configuration; an explicitly named but unreadable document is fatal.
//!
//! Backend settings resolve as `defaults ⊕ config ⊕ caller overrides`:
//! serde fills defaults underneath the document, and CLI flags are layered
//! on top via [`Config::apply_overrides`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable overriding the config location.
pub const CONFIG_PATH_ENV: &str = "TIRCORDER_CONFIG_PATH";

/// Current config schema version.
const CURRENT_VERSION: u32 = 1;

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    Missing(PathBuf),

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed config {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Schema version for migrations.
    pub version: ConfigVersion,
    /// Folders imported into the store at startup.
    pub recordings_folders: Vec<FolderConfig>,
    /// Directory scan settings.
    pub scanner: ScannerConfig,
    /// CPU throttle and outbound pacing.
    pub governor: GovernorConfig,
    /// Transcription backend selection and options.
    pub transcription: TranscriptionConfig,
    /// WAV→FLAC conversion settings.
    pub converter: ConverterConfig,
    /// State database location (default `~/.tircorder/state.db`).
    pub database_path: Option<PathBuf>,
    /// Snapshot artifact location (default `state_backup.json` beside the
    /// database).
    pub snapshot_path: Option<PathBuf>,
}

/// Newtype so the version default is the current schema, not zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigVersion(pub u32);

impl Default for ConfigVersion {
    fn default() -> Self {
        Self(CURRENT_VERSION)
    }
}

/// A watched folder with its stage opt-outs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    pub path: String,
    pub ignore_transcribing: bool,
    pub ignore_converting: bool,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            ignore_transcribing: false,
            ignore_converting: false,
        }
    }
}

/// Directory scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Pause between scan passes, in seconds.
    pub scan_interval_secs: u64,
    /// Files admitted per store transaction.
    pub batch_size: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 5,
            batch_size: 100,
        }
    }
}

/// Resource governor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// CPU usage ceiling before new work is throttled.
    pub cpu_max_percent: f32,
    /// Recheck pause while throttled, in seconds.
    pub cpu_check_interval_secs: f64,
    /// Minimum spacing between outbound backend calls, in seconds.
    pub outbound_interval_secs: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            cpu_max_percent: 85.0,
            cpu_check_interval_secs: 0.5,
            outbound_interval_secs: 0.0,
        }
    }
}

/// Which transcription backend handles popped items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionMethod {
    /// Local in-process model, plain-text output.
    PythonWhisper,
    /// Local in-process model, per-segment output with timings.
    #[default]
    Ctranslate2,
    /// `whisper-ctranslate2` subprocess.
    Ctranslate2Nonpythonic,
    /// Remote WhisperX-WebUI server.
    Webui,
}

impl fmt::Display for TranscriptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TranscriptionMethod::PythonWhisper => "python_whisper",
            TranscriptionMethod::Ctranslate2 => "ctranslate2",
            TranscriptionMethod::Ctranslate2Nonpythonic => "ctranslate2_nonpythonic",
            TranscriptionMethod::Webui => "webui",
        };
        f.write_str(name)
    }
}

/// Transcription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub method: TranscriptionMethod,
    /// Model name passed to local backends (e.g. "medium.en").
    pub model: String,
    /// GGML model file for the in-process backend.
    pub model_path: Option<PathBuf>,
    /// Transcription language code.
    pub language: String,
    pub webui: WebuiConfig,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            method: TranscriptionMethod::default(),
            model: "medium.en".to_string(),
            model_path: None,
            language: "en".to_string(),
            webui: WebuiConfig::default(),
        }
    }
}

fn default_webui_timeout() -> Option<f64> {
    Some(600.0)
}

/// Remote WhisperX-WebUI backend settings. `options` is passed verbatim to
/// the endpoint; nested values are JSON-encoded per form field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebuiConfig {
    pub base_url: String,
    pub transcribe_path: String,
    pub options: serde_json::Map<String, serde_json::Value>,
    /// Transport timeout in seconds; explicit `null` disables it.
    #[serde(default = "default_webui_timeout")]
    pub timeout: Option<f64>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub verify_ssl: bool,
    /// Emit the execution-envelope JSON beside each transcript.
    pub emit_envelope: bool,
    /// Envelope destination; defaults to the transcript's directory.
    pub envelope_dir: Option<PathBuf>,
}

impl Default for WebuiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:7860".to_string(),
            transcribe_path: "/_transcribe_file".to_string(),
            options: serde_json::Map::new(),
            timeout: default_webui_timeout(),
            username: None,
            password: None,
            api_key: None,
            headers: BTreeMap::new(),
            verify_ssl: true,
            emit_envelope: false,
            envelope_dir: None,
        }
    }
}

/// WAV→FLAC conversion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// External media tool invoked as `<tool> -i <in> -c:a flac <out>`.
    pub media_tool: String,
    /// Pause between retries while transcription is still active, seconds.
    pub busy_pause_secs: u64,
    /// Retries before the item is pushed back for a later cycle.
    pub busy_attempts: u32,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            media_tool: "ffmpeg".to_string(),
            busy_pause_secs: 10,
            busy_attempts: 5,
        }
    }
}

impl Config {
    /// Resolves the config location: env override, else the home default.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tircorder_config.json")
    }

    /// Loads the configuration document.
    ///
    /// A missing file at the default location yields defaults; a missing
    /// file at an explicitly configured location is fatal, as is malformed
    /// JSON anywhere.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var(CONFIG_PATH_ENV).is_ok();
        let path = Self::default_path();
        Self::load_from(&path, explicit)
    }

    pub fn load_from(path: &Path, required: bool) -> Result<Self, ConfigError> {
        if !path.exists() {
            if required {
                return Err(ConfigError::Missing(path.to_path_buf()));
            }
            tracing::info!(
                "no config at {}; using built-in defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Layers CLI overrides on top of the document (the outermost `⊕`).
    /// Naming a WebUI URL also selects the WebUI backend.
    pub fn apply_overrides(&mut self, webui_url: Option<&str>, webui_path: Option<&str>) {
        if let Some(url) = webui_url {
            self.transcription.method = TranscriptionMethod::Webui;
            self.transcription.webui.base_url = url.to_string();
        }
        if let Some(path) = webui_path {
            self.transcription.webui.transcribe_path = path.to_string();
        }
    }

    pub fn database_path(&self) -> Result<PathBuf, crate::database::DatabaseError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => crate::database::default_database_path(),
        }
    }

    /// Snapshot artifact location: configured, or beside the database.
    pub fn snapshot_path(&self, db_path: &Path) -> PathBuf {
        match &self.snapshot_path {
            Some(path) => path.clone(),
            None => db_path
                .parent()
                .map(|dir| dir.join("state_backup.json"))
                .unwrap_or_else(|| PathBuf::from("state_backup.json")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.transcription.method, TranscriptionMethod::Ctranslate2);
        assert_eq!(config.transcription.webui.base_url, "http://localhost:7860");
        assert_eq!(config.transcription.webui.transcribe_path, "/_transcribe_file");
        assert_eq!(config.transcription.webui.timeout, Some(600.0));
        assert!(config.transcription.webui.verify_ssl);
        assert!(config.transcription.webui.options.is_empty());
        assert_eq!(config.scanner.scan_interval_secs, 5);
        assert_eq!(config.scanner.batch_size, 100);
        assert_eq!(config.governor.cpu_max_percent, 85.0);
        assert_eq!(config.converter.media_tool, "ffmpeg");
        assert_eq!(config.version, ConfigVersion(1));
    }

    #[test]
    fn test_method_names_are_stable() {
        for (method, name) in [
            (TranscriptionMethod::PythonWhisper, "\"python_whisper\""),
            (TranscriptionMethod::Ctranslate2, "\"ctranslate2\""),
            (
                TranscriptionMethod::Ctranslate2Nonpythonic,
                "\"ctranslate2_nonpythonic\"",
            ),
            (TranscriptionMethod::Webui, "\"webui\""),
        ] {
            assert_eq!(serde_json::to_string(&method).unwrap(), name);
            let parsed: TranscriptionMethod = serde_json::from_str(name).unwrap();
            assert_eq!(parsed, method);
        }
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let json = r#"{
            "transcription": {
                "method": "webui",
                "webui": { "base_url": "http://transcriber:7860" }
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.transcription.method, TranscriptionMethod::Webui);
        assert_eq!(config.transcription.webui.base_url, "http://transcriber:7860");
        // Everything omitted keeps the documented defaults.
        assert_eq!(config.transcription.webui.timeout, Some(600.0));
        assert_eq!(config.scanner.scan_interval_secs, 5);
    }

    #[test]
    fn test_null_timeout_disables_transport_timeout() {
        let json = r#"{ "transcription": { "webui": { "timeout": null } } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.transcription.webui.timeout, None);
    }

    #[test]
    fn test_missing_file_behaviour() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        let config = Config::load_from(&path, false).unwrap();
        assert_eq!(config.scanner.batch_size, 100);

        let err = Config::load_from(&path, true).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Config::load_from(&path, false).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn test_cli_overrides_select_webui() {
        let mut config = Config::default();
        config.apply_overrides(Some("http://gpu-box:7860"), Some("/api/transcribe"));
        assert_eq!(config.transcription.method, TranscriptionMethod::Webui);
        assert_eq!(config.transcription.webui.base_url, "http://gpu-box:7860");
        assert_eq!(config.transcription.webui.transcribe_path, "/api/transcribe");

        let mut untouched = Config::default();
        untouched.apply_overrides(None, None);
        assert_eq!(untouched.transcription.method, TranscriptionMethod::Ctranslate2);
    }

    #[test]
    fn test_round_trip_preserves_document() {
        let mut config = Config::default();
        config.recordings_folders.push(FolderConfig {
            path: "/rec".to_string(),
            ignore_transcribing: false,
            ignore_converting: true,
        });
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.recordings_folders.len(), 1);
        assert!(back.recordings_folders[0].ignore_converting);
    }
}
