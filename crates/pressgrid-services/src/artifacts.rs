//! Local backup artifacts and their digests.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Root under the artifact dir that mirrors the object-store layout.
pub const ARTIFACT_ROOT: &str = "pressgrid-artifacts";

const FALLBACK_RELATIVE: &str = "backups/unknown/unknown.tar.zst";

/// Object-store path of a backup.
pub fn storage_path(environment_id: &str, backup_id: &str) -> String {
    format!("s3://pressgrid/backups/{environment_id}/{backup_id}.tar.zst")
}

/// Deterministic local path for a backup's `storage_path`.
pub fn local_artifact_path(artifact_dir: &Path, storage_path: &str) -> PathBuf {
    let trimmed = storage_path.trim();
    let trimmed = trimmed.strip_prefix("s3://").unwrap_or(trimmed);
    let trimmed = trimmed.trim_start_matches('/');
    let relative = if trimmed.is_empty() { FALLBACK_RELATIVE } else { trimmed };

    let mut path = artifact_dir.join(ARTIFACT_ROOT);
    path.extend(relative.split('/').filter(|s| !s.is_empty()));
    path
}

/// `sha256:<hex>` of `bytes`.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Checksum and size of the file at `path`.
pub fn checksum_file(path: &Path) -> io::Result<(String, u64)> {
    let bytes = std::fs::read(path)?;
    Ok((checksum_bytes(&bytes), bytes.len() as u64))
}

/// Write `body` at `path`, creating parent directories.
pub fn write_artifact(path: &Path, body: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, body)
}
