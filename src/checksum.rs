//! SHA-256 helpers for object files.

use std::io::Read;

use anyhow::{Context, Result};
use camino::Utf8Path;
use sha2::{Digest, Sha256};

/// Compute the SHA-256 of a file's contents, returned as lowercase hex.
///
/// Both sides hash the object file as stored on disk; on the receiver that
/// means the staged file it just wrote, so what is verified is exactly what
/// gets promoted.
pub fn file_sha256(path: &Utf8Path) -> Result<String> {
    let mut f = std::fs::File::open(path).with_context(|| format!("Opening {path}"))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).with_context(|| format!("Reading {path}"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
