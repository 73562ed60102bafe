use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Append-only log of `key:offset` lines for primary-key assignments that
/// have not been merged into the snapshot yet.
///
/// Appends go straight to the file without user-space buffering and are
/// synced, so every acknowledged assignment survives a crash.
pub struct WriteLog {
    path: PathBuf,
    file: File,
}

impl WriteLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    pub fn append(&mut self, key: &str, offset: u64) -> Result<()> {
        let line = format!("{key}:{offset}\n");
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Entries in log order. Lines that do not parse, such as a torn final
    /// write, are skipped.
    pub fn replay(&self) -> Result<Vec<(String, u64)>> {
        let file = OpenOptions::new().read(true).open(&self.path)?;
        let reader = BufReader::new(file);
        let mut res = Vec::new();
        for (lineno, line) in reader.split(b'\n').enumerate() {
            let line = line?;
            match parse_line(&line) {
                Some(entry) => res.push(entry),
                None => tracing::warn!(
                    log = %self.path.display(),
                    line = lineno + 1,
                    "skipping malformed write-log entry"
                ),
            }
        }
        Ok(res)
    }

    /// Return log length in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;
        Ok(())
    }
}

fn parse_line(line: &[u8]) -> Option<(String, u64)> {
    let text = std::str::from_utf8(line).ok()?;
    // keys may contain ':' themselves; the offset never does
    let (key, offset) = text.rsplit_once(':')?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), offset.parse().ok()?))
}
