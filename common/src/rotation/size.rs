use crate::error::{IoContext, Result};
use crate::BYTES_PER_MB;
use std::fs;
use std::path::Path;

/// Current size of `path` in binary megabytes.
pub fn size_in_mb(path: &Path) -> Result<f64> {
    let len = fs::metadata(path)
        .io_context(|| format!("failed to stat {}", path.display()))?
        .len();
    Ok(len as f64 / BYTES_PER_MB as f64)
}

/// True once the file has reached `max_size_mb`.
pub fn should_rotate(path: &Path, max_size_mb: f64) -> Result<bool> {
    Ok(size_in_mb(path)? >= max_size_mb)
}
