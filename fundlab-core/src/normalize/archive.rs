//! Zip archive access for the regulator's monthly bundles.

use super::PayloadError;
use std::io::{Cursor, Read};
use zip::ZipArchive;

/// One CSV entry extracted from an archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl ArchiveEntry {
    /// File name without directories, lowercased, for pattern matching.
    pub fn file_name(&self) -> String {
        self.name
            .rsplit('/')
            .next()
            .unwrap_or(&self.name)
            .to_lowercase()
    }
}

/// Read every `.csv` entry of an archive, sorted by name.
pub fn read_entries(bytes: &[u8]) -> Result<Vec<ArchiveEntry>, PayloadError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| PayloadError::Archive(e.to_string()))?;

    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| PayloadError::Archive(e.to_string()))?;
        if entry.is_dir() || !entry.name().to_lowercase().ends_with(".csv") {
            continue;
        }
        let name = entry.name().to_string();
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut buf)
            .map_err(|e| PayloadError::Archive(format!("{name}: {e}")))?;
        entries.push(ArchiveEntry { name, bytes: buf });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
