// SPDX-License-Identifier: MIT OR Apache-2.0
//! Snapshot payload codec: directory tree ⇄ gzip'd tar, base64-embedded
//! with a SHA-256 checksum over the raw archive bytes.
//!
//! Unpacking is defensive: entry paths are validated before any write so
//! a hostile archive cannot escape its destination directory.

use crate::TransportError;
use awcp_core::SnapshotPayload;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Pack a directory tree into a payload.
///
/// # Errors
///
/// Filesystem or archive encoding failures.
pub fn pack_tree(root: &Path) -> Result<SnapshotPayload, TransportError> {
    let buf: Vec<u8> = Vec::new();
    let enc = GzEncoder::new(buf, Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| TransportError::Io {
            path: root.to_path_buf(),
            source: e.into(),
        })?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        if entry.file_type().is_dir() {
            builder
                .append_dir(rel, entry.path())
                .map_err(|e| TransportError::io(entry.path(), e))?;
        } else if entry.file_type().is_file() {
            builder
                .append_path_with_name(entry.path(), rel)
                .map_err(|e| TransportError::io(entry.path(), e))?;
        }
    }

    let enc = builder
        .into_inner()
        .map_err(|e| TransportError::io(root, e))?;
    let bytes = enc.finish().map_err(|e| TransportError::io(root, e))?;

    Ok(SnapshotPayload {
        checksum_sha256: hex_sha256(&bytes),
        archive_b64: BASE64.encode(&bytes),
    })
}

/// Decode and verify a payload, unpacking entries into `dest`.
///
/// `filter` sees each entry's relative path; entries it rejects are
/// skipped silently. Returns the number of files written.
///
/// # Errors
///
/// Base64/gzip/tar decode failures, checksum mismatches, traversal
/// attempts, or filesystem errors.
pub fn unpack_tree(
    payload: &SnapshotPayload,
    dest: &Path,
    filter: &dyn Fn(&Path) -> bool,
) -> Result<u64, TransportError> {
    let bytes = BASE64
        .decode(&payload.archive_b64)
        .map_err(|e| TransportError::InvalidPayload {
            reason: format!("invalid base64: {e}"),
        })?;

    let actual = hex_sha256(&bytes);
    if actual != payload.checksum_sha256 {
        return Err(TransportError::ChecksumMismatch {
            expected: payload.checksum_sha256.clone(),
            actual,
        });
    }

    std::fs::create_dir_all(dest).map_err(|e| TransportError::io(dest, e))?;

    let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
    let mut written = 0;
    let entries = archive
        .entries()
        .map_err(|e| TransportError::InvalidPayload {
            reason: format!("unreadable archive: {e}"),
        })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| TransportError::InvalidPayload {
            reason: format!("unreadable archive entry: {e}"),
        })?;
        let rel = entry
            .path()
            .map_err(|e| TransportError::InvalidPayload {
                reason: format!("undecodable entry path: {e}"),
            })?
            .into_owned();
        validate_entry_path(&rel)?;
        if !filter(&rel) {
            continue;
        }

        let target = dest.join(&rel);
        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target)
                    .map_err(|e| TransportError::io(&target, e))?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| TransportError::io(parent, e))?;
                }
                entry
                    .unpack(&target)
                    .map_err(|e| TransportError::io(&target, e))?;
                written += 1;
            }
            // Links and specials never travel; the packer only emits
            // directories and regular files.
            _ => continue,
        }
    }

    Ok(written)
}

/// Lowercase hex SHA-256.
#[must_use]
pub fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn validate_entry_path(rel: &Path) -> Result<(), TransportError> {
    let hostile = rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if hostile {
        return Err(TransportError::InvalidPayload {
            reason: format!("archive entry escapes destination: {}", rel.display()),
        });
    }
    Ok(())
}

/// Blocking-friendly wrapper: pack on the blocking pool.
///
/// # Errors
///
/// Propagates [`pack_tree`] failures; a cancelled blocking task is a
/// setup failure.
pub async fn pack_tree_async(root: PathBuf) -> Result<SnapshotPayload, TransportError> {
    tokio::task::spawn_blocking(move || pack_tree(&root))
        .await
        .map_err(|e| TransportError::Setup {
            reason: format!("archive task failed: {e}"),
        })?
}

/// Blocking-friendly wrapper: unpack on the blocking pool.
///
/// # Errors
///
/// Propagates [`unpack_tree`] failures.
pub async fn unpack_tree_async(
    payload: SnapshotPayload,
    dest: PathBuf,
    filter: impl Fn(&Path) -> bool + Send + 'static,
) -> Result<u64, TransportError> {
    tokio::task::spawn_blocking(move || unpack_tree(&payload, &dest, &filter))
        .await
        .map_err(|e| TransportError::Setup {
            reason: format!("archive task failed: {e}"),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn all(_: &Path) -> bool {
        true
    }

    #[test]
    fn pack_then_unpack_is_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("a.txt"), "alpha");
        write(&src.join("nested/deep/b.txt"), "beta");

        let payload = pack_tree(&src).unwrap();
        let dest = tmp.path().join("dest");
        let written = unpack_tree(&payload, &dest, &all).unwrap();

        assert_eq!(written, 2);
        assert_eq!(std::fs::read_to_string(dest.join("a.txt")).unwrap(), "alpha");
        assert_eq!(
            std::fs::read_to_string(dest.join("nested/deep/b.txt")).unwrap(),
            "beta"
        );
    }

    #[test]
    fn checksum_is_stable_hex() {
        assert_eq!(
            hex_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn tampered_payload_fails_checksum() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("f"), "x");
        let mut payload = pack_tree(&src).unwrap();
        payload.checksum_sha256 = "0".repeat(64);

        let err = unpack_tree(&payload, &tmp.path().join("dest"), &all).unwrap_err();
        assert!(matches!(err, TransportError::ChecksumMismatch { .. }));
    }

    #[test]
    fn garbage_base64_is_invalid_payload() {
        let payload = SnapshotPayload {
            archive_b64: "!!!not-base64!!!".into(),
            checksum_sha256: "00".into(),
        };
        let tmp = tempfile::tempdir().unwrap();
        let err = unpack_tree(&payload, tmp.path(), &all).unwrap_err();
        assert!(matches!(err, TransportError::InvalidPayload { .. }));
    }

    #[test]
    fn filter_limits_what_is_written() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("keep/f.txt"), "yes");
        write(&src.join("drop/g.txt"), "no");

        let payload = pack_tree(&src).unwrap();
        let dest = tmp.path().join("dest");
        let written = unpack_tree(&payload, &dest, &|p| p.starts_with("keep")).unwrap();

        assert_eq!(written, 1);
        assert!(dest.join("keep/f.txt").is_file());
        assert!(!dest.join("drop").exists());
    }

    #[test]
    fn empty_tree_packs_and_unpacks() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let payload = pack_tree(&src).unwrap();
        let written = unpack_tree(&payload, &tmp.path().join("dest"), &all).unwrap();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn async_wrappers_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("f"), "x");

        let payload = pack_tree_async(src).await.unwrap();
        let dest = tmp.path().join("dest");
        let written = unpack_tree_async(payload, dest.clone(), |_| true).await.unwrap();
        assert_eq!(written, 1);
        assert!(dest.join("f").is_file());
    }
}
