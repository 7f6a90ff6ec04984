//! Recording filename conventions.
//!
//! Recordings conventionally carry a sortable timestamp token, either
//! `YYYY-MM-DD_HH-MM-SS` or `YYYYMMDD-HHMMSS`. The token is stored next to
//! the file row and doubles as the pairing key between audio files and
//! their transcript artifacts. Files without a recognisable token are
//! skipped by the scanner.

use chrono::NaiveDateTime;
use regex::Regex;
use std::sync::OnceLock;

/// Audio extensions the pipeline recognises. WAV is the only conversion
/// source; the rest are indexed and transcribed as-is.
pub const AUDIO_EXTENSIONS: &[&str] = &["wav", "flac", "mp3", "ogg", "amr"];

/// Transcript artifact extensions. `.txt` is the canonical output format.
pub const TRANSCRIPT_EXTENSIONS: &[&str] = &["srt", "txt", "vtt", "json", "tsv"];

fn dashed_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}").expect("valid regex")
    })
}

fn compact_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{8}-\d{6}").expect("valid regex"))
}

/// Splits a file name into `(stem, extension)` with the extension
/// lowercased and without its dot. Names without a dot yield an empty
/// extension.
pub fn split_name(file_name: &str) -> (&str, String) {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext.to_ascii_lowercase()),
        _ => (file_name, String::new()),
    }
}

/// Whether the (dotless, lowercase) extension is a recognised audio format.
pub fn is_audio_extension(ext: &str) -> bool {
    AUDIO_EXTENSIONS.contains(&ext)
}

/// Whether the (dotless, lowercase) extension is a transcript format.
pub fn is_transcript_extension(ext: &str) -> bool {
    TRANSCRIPT_EXTENSIONS.contains(&ext)
}

/// Extracts the first timestamp token found in a file name, trying the
/// dashed convention before the compact one.
pub fn datetime_token(file_name: &str) -> Option<&str> {
    dashed_pattern()
        .find(file_name)
        .or_else(|| compact_pattern().find(file_name))
        .map(|m| m.as_str())
}

/// Parses a token previously produced by [`datetime_token`].
pub fn parse_datetime_token(token: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(token, "%Y-%m-%d_%H-%M-%S")
        .or_else(|_| NaiveDateTime::parse_from_str(token, "%Y%m%d-%H%M%S"))
        .ok()
}

/// Timestamp parsed straight from a file name, if the name carries a token.
pub fn datetime_from_name(file_name: &str) -> Option<NaiveDateTime> {
    datetime_token(file_name).and_then(parse_datetime_token)
}
