//! Whole-structure bincode snapshots for metadata and index files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Writes `data` to a sibling temp file, syncs it and renames it over `path`
/// so a crash never leaves a half-written snapshot behind.
pub fn save<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let file = File::create(&tmp)?;
    let mut w = BufWriter::new(file);
    bincode::serialize_into(&mut w, data)?;
    w.flush()?;
    w.get_ref().sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)?;
    Ok(bincode::deserialize(&bytes)?)
}
