//! Database schema definitions.
//!
//! SQL statements for creating and managing the durable state tables.

/// SQL statement to create the migrations tracking table.
pub const CREATE_MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Folders the scanner watches, with per-folder stage opt-outs.
pub const CREATE_RECORDINGS_FOLDERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS recordings_folders (
    id INTEGER PRIMARY KEY,
    folder_path TEXT UNIQUE NOT NULL,
    ignore_transcribing INTEGER NOT NULL DEFAULT 0,
    ignore_converting INTEGER NOT NULL DEFAULT 0
);
"#;

/// Closed extension vocabulary, seeded below.
pub const CREATE_EXTENSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS extensions (
    id INTEGER PRIMARY KEY,
    extension TEXT UNIQUE NOT NULL
);
"#;

/// Every file the scanner has ever observed and classified. `datetimes`
/// holds the timestamp token parsed from the name, where recoverable.
pub const CREATE_KNOWN_FILES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS known_files (
    id INTEGER PRIMARY KEY,
    file_name TEXT NOT NULL,
    folder_id INTEGER NOT NULL,
    extension_id INTEGER,
    datetimes TEXT,
    UNIQUE(file_name, folder_id, datetimes),
    FOREIGN KEY(folder_id) REFERENCES recordings_folders(id),
    FOREIGN KEY(extension_id) REFERENCES extensions(id)
);
"#;

pub const CREATE_AUDIO_FILES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS audio_files (
    id INTEGER PRIMARY KEY,
    known_file_id INTEGER NOT NULL UNIQUE,
    unix_timestamp INTEGER,
    FOREIGN KEY(known_file_id) REFERENCES known_files(id)
);
"#;

pub const CREATE_TRANSCRIPT_FILES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transcript_files (
    id INTEGER PRIMARY KEY,
    known_file_id INTEGER NOT NULL UNIQUE,
    unix_timestamp INTEGER,
    FOREIGN KEY(known_file_id) REFERENCES known_files(id)
);
"#;

/// Durable record that a recording has a transcript.
pub const CREATE_MATCHED_PAIRS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS matched_pairs (
    id INTEGER PRIMARY KEY,
    audio_file_id INTEGER NOT NULL,
    transcript_file_id INTEGER NOT NULL,
    UNIQUE(audio_file_id, transcript_file_id),
    FOREIGN KEY(audio_file_id) REFERENCES audio_files(id),
    FOREIGN KEY(transcript_file_id) REFERENCES transcript_files(id)
);
"#;

/// Durable mirror of the in-memory transcribe queue.
pub const CREATE_TRANSCRIBE_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transcribe_queue (
    id INTEGER PRIMARY KEY,
    known_file_id INTEGER NOT NULL,
    FOREIGN KEY(known_file_id) REFERENCES known_files(id)
);
"#;

/// Durable mirror of the in-memory convert queue.
pub const CREATE_CONVERT_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS convert_queue (
    id INTEGER PRIMARY KEY,
    known_file_id INTEGER NOT NULL,
    FOREIGN KEY(known_file_id) REFERENCES known_files(id)
);
"#;

/// Files excluded from future work, with the durable reason code.
pub const CREATE_SKIP_FILES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS skip_files (
    id INTEGER PRIMARY KEY,
    known_file_id INTEGER NOT NULL,
    reason TEXT NOT NULL,
    FOREIGN KEY(known_file_id) REFERENCES known_files(id)
);
"#;

/// One skip record per file, so repeated sightings never duplicate it.
pub const CREATE_SKIP_FILES_UNIQUE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_skip_files_known_file_id ON skip_files(known_file_id);
"#;

pub const CREATE_KNOWN_FILES_FOLDER_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_known_files_folder_id ON known_files(folder_id);
"#;

/// Seeds the closed audio + transcript extension sets.
pub const SEED_EXTENSIONS: &str = r#"
INSERT OR IGNORE INTO extensions (extension) VALUES
    ('wav'), ('flac'), ('mp3'), ('ogg'), ('amr'),
    ('srt'), ('txt'), ('vtt'), ('json'), ('tsv');
"#;
