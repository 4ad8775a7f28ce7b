//! Integrity checks for file transfer: declared chunk length, saved-file digest,
//! and sanitizing the filename a remote peer asks us to write.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// A decoded chunk must have exactly the length its `CHUNK_SIZE` field declares.
/// A missing declaration is accepted (older senders omit it).
pub fn verify_chunk_len(payload: &[u8], declared: Option<u64>) -> bool {
    declared.map_or(true, |len| payload.len() as u64 == len)
}

/// SHA-256 of a reassembled file, as lowercase hex.
pub fn file_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Destination for a received file: only the final path component of the declared
/// name is used, so a peer cannot write outside `dir`. `None` for names with no usable component.
pub fn safe_destination(dir: &Path, declared_name: &str) -> Option<PathBuf> {
    let name = declared_name.rsplit(|c: char| c == '/' || c == '\\').next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(dir.join(name))
}
