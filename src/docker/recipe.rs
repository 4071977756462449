//! Lexical helpers over the Dockerfile: cache fingerprint and step count.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::error::DockerError;

/// Length of the content digest used to key the local image cache.
const FINGERPRINT_LEN: usize = 12;

/// Deterministic digest of the recipe bytes. Identical bytes always map to
/// the same tag component; any byte change invalidates the cache.
pub fn fingerprint(recipe_path: &Path) -> Result<String, DockerError> {
    let bytes = fs::read(recipe_path)?;
    let digest = Sha256::digest(&bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        write!(hex, "{byte:02x}").expect("writing to a String cannot fail");
    }
    hex.truncate(FINGERPRINT_LEN);
    Ok(hex)
}

/// Number of instructions in the recipe, used to size build progress.
/// Blank lines and `#` comments do not count.
pub fn count_steps(recipe_path: &Path) -> Result<usize, DockerError> {
    let content = fs::read_to_string(recipe_path)?;
    Ok(content
        .lines()
        .map(str::trim_start)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .count())
}
