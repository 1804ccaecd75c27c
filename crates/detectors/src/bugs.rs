//! JSON bug lists.

use salve_core::bug::Bug;
use salve_utils::errors::DetectorError;
use std::fs;
use std::path::Path;

/// Reads a bug list, sorted by pc.
pub fn read_bugs(path: &Path) -> Result<Vec<Bug>, DetectorError> {
    let text = fs::read_to_string(path).map_err(|source| DetectorError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut bugs: Vec<Bug> = serde_json::from_str(&text)?;
    bugs.sort_by_key(|bug| bug.pc);
    Ok(bugs)
}

/// Writes `bugs` as pretty-printed JSON.
pub fn write_bugs(path: &Path, bugs: &[Bug]) -> Result<(), DetectorError> {
    let json = serde_json::to_string_pretty(bugs)?;
    fs::write(path, json).map_err(|source| DetectorError::Io {
        path: path.display().to_string(),
        source,
    })
}
