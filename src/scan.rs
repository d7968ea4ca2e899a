//! Audio file discovery.
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tracing::debug;

/// Extensions the engine's audio loader can decode.
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "flac", "mp3", "mp2", "wav", "m4a", "ogg", "alac", "aif", "opus",
];

/// Checks if a file extension is a supported audio format
#[must_use]
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            AUDIO_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Collect every audio file below `dir`, sorted by path.
///
/// Hidden files are included; `.gitignore`/`.ignore` rules are respected.
#[must_use]
pub fn find_audio_files(dir: &Path) -> Vec<PathBuf> {
    let walker = WalkBuilder::new(dir).hidden(false).build();

    let mut files: Vec<PathBuf> = walker
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .map(ignore::DirEntry::into_path)
        .filter(|p| is_audio_file(p))
        .collect();
    files.sort();

    debug!(dir = %dir.display(), count = files.len(), "Scanned for audio files");
    files
}
