//! Atomic file replacement.
//!
//! Every artefact that a later run reads back (state file, cache entries,
//! page Markdown, figure crops) goes through [`write_atomic`]: the bytes land
//! in a uniquely named temp file in the destination directory and are then
//! renamed over the target. A crash mid-write leaves either the old file or
//! the new one, never a torn mix.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Write `bytes` to `path` via temp-file-then-rename, creating parent
/// directories as needed. Runs on the blocking pool.
pub async fn write_atomic(path: impl AsRef<Path>, bytes: impl Into<Vec<u8>>) -> io::Result<()> {
    let path = path.as_ref().to_path_buf();
    let bytes = bytes.into();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &bytes))
        .await
        .map_err(|e| io::Error::other(format!("write task panicked: {e}")))?
}

fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replaces_existing_file_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/deeper/state.json");

        write_atomic(&target, "first").await.unwrap();
        write_atomic(&target, "second").await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second");
        // No stray temp files left next to the target.
        let entries = std::fs::read_dir(target.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
