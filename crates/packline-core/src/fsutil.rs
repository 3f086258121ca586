//! Filesystem primitives shared by the stores and the photo engine.
//!
//! Atomic writes follow the temp-then-rename discipline: content lands in a
//! `tempfile::NamedTempFile` created in the destination directory (same
//! filesystem, unpredictable name), is fsync'd, and is then renamed over the
//! destination. Readers never observe a partial file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Atomically writes `value` as pretty JSON to `path`.
///
/// The parent directory is created when absent and fsync'd after the rename
/// so the directory entry itself is durable.
///
/// # Errors
///
/// Propagates I/O and serialization failures; the destination is left
/// untouched on any error.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    atomic_write_bytes(path, json.as_bytes())
}

/// Atomically writes raw bytes to `path` (temp file + fsync + rename).
///
/// # Errors
///
/// Propagates I/O failures; the destination is left untouched on any error.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    fsync_dir(parent)?;
    Ok(())
}

/// Fsyncs a directory so a completed rename survives power loss.
///
/// # Errors
///
/// Propagates the open/sync failure.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    let handle = File::open(dir)?;
    handle.sync_all()
}

/// Resolves a destination filename that does not collide with an existing
/// file by appending `_1`, `_2`, ... before the extension.
#[must_use]
pub fn collision_free_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = split_name(filename);
    for n in 1.. {
        let next = dir.join(format!("{stem}_{n}{ext}"));
        if !next.exists() {
            return next;
        }
    }
    unreachable!("collision counter exhausted");
}

/// Splits `name.ext` into (`name`, `.ext`); no-extension names yield
/// (`name`, ``).
fn split_name(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], &filename[idx..]),
        _ => (filename, ""),
    }
}

/// SHA-256 of a file's contents, streamed in 8 KiB chunks.
///
/// # Errors
///
/// Propagates read failures.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex(&hasher.finalize()))
}

/// SHA-256 of a byte slice, hex-encoded.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Total size in bytes of all regular files under `dir`, recursively.
/// Unreadable entries count as zero.
#[must_use]
pub fn dir_size_bytes(dir: &Path) -> u64 {
    let mut total = 0u64;
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total = total.saturating_add(dir_size_bytes(&path));
        } else if let Ok(meta) = entry.metadata() {
            total = total.saturating_add(meta.len());
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_json_creates_parents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("nested/deep/job.json");
        atomic_write_json(&path, &serde_json::json!({"a": 1})).expect("write");
        let text = fs::read_to_string(&path).expect("read back");
        assert!(text.contains("\"a\""));
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("state.json");
        atomic_write_bytes(&path, b"old").expect("first write");
        atomic_write_bytes(&path, b"new").expect("second write");
        assert_eq!(fs::read(&path).expect("read"), b"new");
    }

    #[test]
    fn test_collision_free_path_appends_counter() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("overview.jpg"), b"x").expect("seed");
        fs::write(tmp.path().join("overview_1.jpg"), b"x").expect("seed");
        let next = collision_free_path(tmp.path(), "overview.jpg");
        assert_eq!(next.file_name().unwrap(), "overview_2.jpg");
    }

    #[test]
    fn test_collision_free_path_without_extension() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("README"), b"x").expect("seed");
        let next = collision_free_path(tmp.path(), "README");
        assert_eq!(next.file_name().unwrap(), "README_1");
    }

    #[test]
    fn test_file_sha256_matches_slice_hash() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("blob");
        fs::write(&path, b"packline").expect("write");
        assert_eq!(
            file_sha256(&path).expect("hash"),
            sha256_hex(b"packline")
        );
    }

    #[test]
    fn test_dir_size_recurses() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("sub")).expect("mkdir");
        fs::write(tmp.path().join("a"), vec![0u8; 10]).expect("write");
        fs::write(tmp.path().join("sub/b"), vec![0u8; 5]).expect("write");
        assert_eq!(dir_size_bytes(tmp.path()), 15);
    }
}
