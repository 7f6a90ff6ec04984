//! `whisper-ctranslate2` subprocess backend.
//!
//! Spawns the CLI with a fixed argument vector, streams its stdout and
//! stderr into the log, and derives the audio duration from the tool's
//! `Processing audio` progress lines. The captured stdout becomes the
//! transcript text.

use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{BackendError, Transcription};

/// Default executable name.
const CLI_TOOL: &str = "whisper-ctranslate2";

pub struct CliTranscriber {
    tool: String,
    model: String,
    language: String,
}

impl CliTranscriber {
    pub fn new(model: String, language: String) -> Self {
        Self {
            tool: CLI_TOOL.to_string(),
            model,
            language,
        }
    }

    #[cfg(test)]
    fn with_tool(tool: &str, model: String, language: String) -> Self {
        Self {
            tool: tool.to_string(),
            model,
            language,
        }
    }

    fn build_args(&self, audio_path: &Path) -> Vec<String> {
        let output_dir = audio_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .display()
            .to_string();
        vec![
            audio_path.display().to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--language".to_string(),
            self.language.clone(),
            "--output_dir".to_string(),
            output_dir,
            "--device".to_string(),
            "cpu".to_string(),
        ]
    }

    pub async fn transcribe(&self, audio_path: &Path) -> Result<Transcription, BackendError> {
        let mut child = Command::new(&self.tool)
            .args(self.build_args(audio_path))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Failed(format!("failed to spawn {}: {e}", self.tool)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Failed("no stdout from transcription tool".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Failed("no stderr from transcription tool".into()))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!("transcription tool stderr: {line}");
            }
        });

        let mut output_lines = Vec::new();
        let mut bounds: Option<(f64, f64)> = None;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| BackendError::Failed(e.to_string()))?
        {
            if line.contains("Processing audio") {
                if let Some(parsed) = parse_progress_line(&line) {
                    bounds = Some(parsed);
                }
            }
            tracing::info!("{}", line.trim_end());
            output_lines.push(line);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| BackendError::Failed(e.to_string()))?;
        let _ = stderr_task.await;

        if !status.success() {
            return Err(BackendError::Failed(format!(
                "{} exited with {status}",
                self.tool
            )));
        }

        let text = output_lines.join("\n").trim().to_string();
        if text.is_empty() {
            return Err(BackendError::Failed(
                "transcription tool produced no output".into(),
            ));
        }

        let duration_seconds = bounds.map(|(start, end)| end - start).unwrap_or(0.0);
        Ok(Transcription {
            text,
            duration_seconds,
            model: Some(self.model.clone()),
            language: Some(self.language.clone()),
            segments: Vec::new(),
        })
    }
}

/// Pulls the segment bounds out of a `Processing audio … <start>s … <end>s`
/// progress line.
fn parse_progress_line(line: &str) -> Option<(f64, f64)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let start = parts.get(3)?.trim_end_matches('s').parse().ok()?;
    let end = parts.get(5)?.trim_end_matches('s').parse().ok()?;
    Some((start, end))
}
