//! Execution-envelope emission for remote transcriptions.
//!
//! An optional JSON artifact written beside the transcript, carrying
//! content hashes and provenance only. It is strictly non-semantic: segment
//! records keep the recogniser's own fields (text, bounds, speaker,
//! confidence) and nothing interpretive is ever added.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

use super::Transcription;

pub const ADAPTER_LABEL: &str = "tircorder_whisperx_webui_v1";
pub const ENVELOPE_FORMAT: &str = "sb_execution_envelope_v1";
pub const ENVELOPE_SOURCE: &str = "whisperx_webui";

/// File suffix replacing the transcript's `.txt`.
pub const ENVELOPE_SUFFIX: &str = "execution_envelope.json";

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Canonical transcript payload whose hash anchors the envelope identity.
fn transcript_payload(transcription: &Transcription) -> Value {
    json!({
        "text": transcription.text,
        "model": transcription.model,
        "language": transcription.language,
        "segments": transcription.segments,
    })
}

/// Builds the envelope plus per-segment events. The envelope id is derived
/// from the transcript hash and the audio content hash, so identical inputs
/// produce the identical identity.
pub fn build_envelope(
    transcription: &Transcription,
    audio_path: Option<&Path>,
) -> std::io::Result<Value> {
    let audio_hash = match audio_path {
        Some(path) => Some(sha256_file(path)?),
        None => None,
    };

    let payload = transcript_payload(transcription);
    let transcript_hash = sha256_hex(payload.to_string().as_bytes());

    let id_source = format!(
        "{ENVELOPE_SOURCE}:{transcript_hash}:{}",
        audio_hash.as_deref().unwrap_or("no-audio")
    );
    let envelope_id = sha256_hex(id_source.as_bytes());

    let envelope = json!({
        "type": "execution_envelope",
        "id": envelope_id,
        "format": ENVELOPE_FORMAT,
        "source": ENVELOPE_SOURCE,
        "toolchain": {
            "model": transcription.model,
            "language": transcription.language,
        },
        "audio_hash": audio_hash,
        "segment_count": transcription.segments.len(),
        "provenance": {
            "transcript_hash": transcript_hash,
            "adapter": ADAPTER_LABEL,
        },
        "created_at": chrono::Utc::now().to_rfc3339(),
    });

    let segment_events: Vec<Value> = transcription
        .segments
        .iter()
        .map(|segment| {
            let mut data = match serde_json::to_value(segment) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            };
            data.insert(
                "provenance".to_string(),
                json!({ "source": ENVELOPE_SOURCE, "envelope_id": envelope_id }),
            );
            if let Some(hash) = &audio_hash {
                data.insert("audio_hash".to_string(), json!(hash));
            }
            json!({ "type": "audio_segment", "data": data })
        })
        .collect();

    Ok(json!({
        "execution_envelope": envelope,
        "segment_events": segment_events,
    }))
}

/// Destination for the envelope: the transcript's stem with the envelope
/// suffix, optionally relocated into a configured directory.
pub fn envelope_path(transcript_path: &Path, envelope_dir: Option<&Path>) -> PathBuf {
    let base = match envelope_dir {
        Some(dir) => dir.join(
            transcript_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("transcript.txt")),
        ),
        None => transcript_path.to_path_buf(),
    };
    base.with_extension(ENVELOPE_SUFFIX)
}

/// Writes the artifact, creating parent directories as needed.
pub fn write_envelope(path: &Path, envelope: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(envelope)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcribe::Segment;

    fn sample_transcription() -> Transcription {
        Transcription {
            text: "[0.00s -> 2.00s] hello".to_string(),
            duration_seconds: 2.0,
            model: Some("large-v3".to_string()),
            language: Some("en".to_string()),
            segments: vec![Segment {
                text: "hello".to_string(),
                start: Some(0.0),
                end: Some(2.0),
                speaker: None,
                confidence: Some(0.9),
            }],
        }
    }

    #[test]
    fn test_envelope_identity_is_content_derived() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("2024-05-06_10-00-00.wav");
        std::fs::write(&audio, b"RIFF....WAVE").unwrap();

        let a = build_envelope(&sample_transcription(), Some(&audio)).unwrap();
        let b = build_envelope(&sample_transcription(), Some(&audio)).unwrap();
        assert_eq!(
            a["execution_envelope"]["id"],
            b["execution_envelope"]["id"]
        );

        // Different audio content, different identity.
        std::fs::write(&audio, b"RIFF....WAVE....more").unwrap();
        let c = build_envelope(&sample_transcription(), Some(&audio)).unwrap();
        assert_ne!(
            a["execution_envelope"]["id"],
            c["execution_envelope"]["id"]
        );
    }

    #[test]
    fn test_envelope_carries_hashes_and_provenance() {
        let envelope = build_envelope(&sample_transcription(), None).unwrap();
        let header = &envelope["execution_envelope"];

        assert_eq!(header["format"], ENVELOPE_FORMAT);
        assert_eq!(header["source"], ENVELOPE_SOURCE);
        assert_eq!(header["segment_count"], 1);
        assert_eq!(header["provenance"]["adapter"], ADAPTER_LABEL);
        assert!(header["provenance"]["transcript_hash"]
            .as_str()
            .is_some_and(|h| h.len() == 64));
        assert!(header["audio_hash"].is_null());
    }

    #[test]
    fn test_segment_events_stay_non_semantic() {
        let envelope = build_envelope(&sample_transcription(), None).unwrap();
        let events = envelope["segment_events"].as_array().unwrap();
        assert_eq!(events.len(), 1);

        let data = events[0]["data"].as_object().unwrap();
        for key in data.keys() {
            assert!(
                matches!(
                    key.as_str(),
                    "text" | "start" | "end" | "speaker" | "confidence" | "provenance"
                        | "audio_hash"
                ),
                "unexpected segment key: {key}"
            );
        }
        // Interpretive labels must never appear.
        for forbidden in ["summary", "sentiment", "intent", "emotion", "diagnosis"] {
            assert!(!data.contains_key(forbidden));
        }
        // Absent recogniser fields are omitted, not null-padded.
        assert!(!data.contains_key("speaker"));
    }

    #[test]
    fn test_envelope_path_replaces_transcript_extension() {
        let path = envelope_path(Path::new("/rec/2024-05-06_10-00-00.txt"), None);
        assert_eq!(
            path,
            PathBuf::from("/rec/2024-05-06_10-00-00.execution_envelope.json")
        );

        let relocated = envelope_path(
            Path::new("/rec/2024-05-06_10-00-00.txt"),
            Some(Path::new("/envelopes")),
        );
        assert_eq!(
            relocated,
            PathBuf::from("/envelopes/2024-05-06_10-00-00.execution_envelope.json")
        );
    }

    #[test]
    fn test_write_envelope_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.execution_envelope.json");
        let envelope = build_envelope(&sample_transcription(), None).unwrap();

        write_envelope(&path, &envelope).unwrap();
        let read: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read["execution_envelope"]["format"], ENVELOPE_FORMAT);
    }
}
