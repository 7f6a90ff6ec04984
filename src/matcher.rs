//! Audio/transcript pairing.
//!
//! Rebuilds the matched-pairs table from the catalog: an audio artifact
//! pairs with the transcript sharing its basename stem (or, failing that,
//! its timestamp token) within the same folder. Runs during housekeeping
//! when both queues are idle; dangling artifacts are reported for the
//! operator.

use std::collections::HashMap;

use crate::database::store::{ArtifactEntry, StoreError};
use crate::database::writer::Store;
use crate::filename;

/// Outcome of one pairing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchReport {
    pub pairs: usize,
    pub dangling_audio: usize,
    pub dangling_transcripts: usize,
}

/// Pairs audio rows with transcript rows. Pure so it can be tested without
/// a store; the result is ordered oldest-first by timestamp token.
pub fn match_artifacts(
    audio: &[ArtifactEntry],
    transcripts: &[ArtifactEntry],
) -> Vec<(i64, i64)> {
    let mut by_stem: HashMap<(i64, String), &ArtifactEntry> = HashMap::new();
    let mut by_token: HashMap<(i64, String), &ArtifactEntry> = HashMap::new();
    for transcript in transcripts {
        let (stem, _) = filename::split_name(&transcript.file_name);
        by_stem
            .entry((transcript.folder_id, stem.to_string()))
            .or_insert(transcript);
        if let Some(token) = &transcript.datetimes {
            by_token
                .entry((transcript.folder_id, token.clone()))
                .or_insert(transcript);
        }
    }

    let mut matched: Vec<(&ArtifactEntry, &ArtifactEntry)> = Vec::new();
    for entry in audio {
        let (stem, _) = filename::split_name(&entry.file_name);
        let partner = by_stem
            .get(&(entry.folder_id, stem.to_string()))
            .copied()
            .or_else(|| {
                entry
                    .datetimes
                    .as_ref()
                    .and_then(|token| by_token.get(&(entry.folder_id, token.clone())).copied())
            });
        if let Some(transcript) = partner {
            matched.push((entry, transcript));
        }
    }

    matched.sort_by(|a, b| {
        let key = |e: &ArtifactEntry| (e.datetimes.clone(), e.file_name.clone());
        key(a.0).cmp(&key(b.0))
    });
    matched
        .into_iter()
        .map(|(a, t)| (a.artifact_id, t.artifact_id))
        .collect()
}

/// Full pass: rebuild the pair table and report what is left dangling.
/// The catalog is a cache of the filesystem, so artifacts whose files have
/// vanished are ignored rather than paired.
pub async fn run_matching_pass(store: &Store) -> Result<MatchReport, StoreError> {
    let folders: HashMap<i64, std::path::PathBuf> = store
        .list_folders()
        .await?
        .into_iter()
        .map(|f| (f.id, f.path))
        .collect();
    let on_disk = |entry: &ArtifactEntry| {
        folders
            .get(&entry.folder_id)
            .is_some_and(|dir| dir.join(&entry.file_name).exists())
    };

    let audio: Vec<ArtifactEntry> = store
        .list_audio_entries()
        .await?
        .into_iter()
        .filter(|e| on_disk(e))
        .collect();
    let transcripts: Vec<ArtifactEntry> = store
        .list_transcript_entries()
        .await?
        .into_iter()
        .filter(|e| on_disk(e))
        .collect();

    let pairs = match_artifacts(&audio, &transcripts);
    store.replace_pairs(pairs.clone()).await?;

    let (dangling_audio, dangling_transcripts) = store.list_dangling().await?;
    let report = MatchReport {
        pairs: pairs.len(),
        dangling_audio: dangling_audio.len(),
        dangling_transcripts: dangling_transcripts.len(),
    };
    tracing::debug!(
        "matched {} pairs; {} dangling audio, {} dangling transcripts",
        report.pairs,
        report.dangling_audio,
        report.dangling_transcripts
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(
        artifact_id: i64,
        folder_id: i64,
        file_name: &str,
    ) -> ArtifactEntry {
        ArtifactEntry {
            artifact_id,
            known_file_id: artifact_id,
            folder_id,
            file_name: file_name.to_string(),
            datetimes: filename::datetime_token(file_name).map(str::to_string),
        }
    }

    #[test]
    fn test_stem_matching_within_folder() {
        let audio = vec![
            entry(1, 1, "2024-05-06_10-00-00.wav"),
            entry(2, 1, "2024-05-07_09-00-00.wav"),
        ];
        let transcripts = vec![entry(10, 1, "2024-05-06_10-00-00.txt")];

        let pairs = match_artifacts(&audio, &transcripts);
        assert_eq!(pairs, vec![(1, 10)]);
    }

    #[test]
    fn test_no_cross_folder_matches() {
        let audio = vec![entry(1, 1, "2024-05-06_10-00-00.wav")];
        let transcripts = vec![entry(10, 2, "2024-05-06_10-00-00.txt")];
        assert!(match_artifacts(&audio, &transcripts).is_empty());
    }

    #[test]
    fn test_token_fallback_bridges_naming_styles() {
        // Same instant, different naming convention around the token.
        let audio = vec![entry(1, 1, "capture_2024-05-06_10-00-00_raw.wav")];
        let transcripts = vec![entry(10, 1, "session_2024-05-06_10-00-00.txt")];

        let pairs = match_artifacts(&audio, &transcripts);
        assert_eq!(pairs, vec![(1, 10)]);
    }

    #[test]
    fn test_pairs_sorted_oldest_first() {
        let audio = vec![
            entry(2, 1, "2024-05-07_09-00-00.wav"),
            entry(1, 1, "2024-05-06_10-00-00.wav"),
        ];
        let transcripts = vec![
            entry(10, 1, "2024-05-06_10-00-00.txt"),
            entry(11, 1, "2024-05-07_09-00-00.txt"),
        ];

        let pairs = match_artifacts(&audio, &transcripts);
        assert_eq!(pairs, vec![(1, 10), (2, 11)]);
    }

    #[tokio::test]
    async fn test_full_pass_records_pairs_and_dangling() {
        let dir = tempfile::tempdir().unwrap();
        let rec = dir.path().join("rec");
        std::fs::create_dir(&rec).unwrap();
        let (store, _writer) = Store::open(&dir.path().join("state.db")).unwrap();
        let folder = store
            .upsert_folder(rec.display().to_string(), false, false)
            .await
            .unwrap();

        for (name, ext, is_audio) in [
            ("2024-05-06_10-00-00.wav", "wav", true),
            ("2024-05-06_10-00-00.txt", "txt", false),
            ("2024-05-07_09-00-00.wav", "wav", true),
        ] {
            std::fs::write(rec.join(name), b"data").unwrap();
            let id = store
                .upsert_known_file(
                    folder,
                    name.to_string(),
                    ext.to_string(),
                    filename::datetime_token(name).map(str::to_string),
                )
                .await
                .unwrap();
            if is_audio {
                store.note_audio(id, 100).await.unwrap();
            } else {
                store.note_transcript(id, 100).await.unwrap();
            }
        }

        let report = run_matching_pass(&store).await.unwrap();
        assert_eq!(
            report,
            MatchReport {
                pairs: 1,
                dangling_audio: 1,
                dangling_transcripts: 0
            }
        );
        assert_eq!(store.list_pairs().await.unwrap().len(), 1);

        // A second pass is stable.
        let report = run_matching_pass(&store).await.unwrap();
        assert_eq!(report.pairs, 1);

        // The catalog is only a cache: once the transcript vanishes from
        // disk the pair is not rebuilt.
        std::fs::remove_file(rec.join("2024-05-06_10-00-00.txt")).unwrap();
        let report = run_matching_pass(&store).await.unwrap();
        assert_eq!(report.pairs, 0);
    }
}
