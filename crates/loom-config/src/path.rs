//! Path normalization for paths that cross process boundaries.
//!
//! A filter file path travels CLI → controller → every daemon, and each
//! daemon opens it from its own working directory. Paths must therefore be
//! absolute before they leave the CLI.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Normalize a path for IPC communication.
///
/// Resolves symlinks and returns an absolute path. Fails if the path does not
/// exist.
pub fn normalize_for_ipc(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    path.canonicalize()
        .with_context(|| format!("Failed to resolve path for IPC: {}", path.display()))
}

/// Reject paths that would not survive the space-separated command line.
pub fn is_wire_safe(path: &Path) -> bool {
    match path.to_str() {
        Some(s) => !s.is_empty() && !s.chars().any(char::is_whitespace),
        None => false,
    }
}
