//! Synchronous file access used by the script file-system bridge and by
//! subscription bootstrap.

use std::{fs, io, sync::Arc, time::UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatResult {
    pub exists: bool,
    pub last_modified_millis: i64,
}

pub trait FileSystem: Send + Sync {
    /// # Errors
    /// Returns a message suitable for a script error callback
    fn read(&self, path: &Utf8Path) -> Result<Vec<u8>, String>;

    /// # Errors
    /// Returns a message suitable for a script error callback
    fn write(&self, path: &Utf8Path, data: &[u8]) -> Result<(), String>;

    /// # Errors
    /// Returns a message suitable for a script error callback
    fn move_file(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), String>;

    /// Not-found is a successful stat with `exists == false`.
    ///
    /// # Errors
    /// Returns a message for any other failure
    fn stat(&self, path: &Utf8Path) -> Result<StatResult, String>;

    fn resolve(&self, path: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(path)
    }
}

pub type SharedFileSystem = Arc<dyn FileSystem>;

/// `std::fs` backed file system, relative paths resolve against `base_dir`
#[derive(Debug, Clone, Default)]
pub struct DefaultFileSystem {
    base_dir: Option<Utf8PathBuf>,
}

impl DefaultFileSystem {
    pub fn new(base_dir: Option<Utf8PathBuf>) -> Self {
        Self { base_dir }
    }
}

impl FileSystem for DefaultFileSystem {
    fn read(&self, path: &Utf8Path) -> Result<Vec<u8>, String> {
        fs::read(path).map_err(|e| format!("Failed to open {path} ({e})"))
    }

    fn write(&self, path: &Utf8Path, data: &[u8]) -> Result<(), String> {
        fs::write(path, data).map_err(|e| format!("Failed to write {path} ({e})"))
    }

    fn move_file(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), String> {
        fs::rename(from, to).map_err(|e| format!("Failed to move {from} to {to} ({e})"))
    }

    fn stat(&self, path: &Utf8Path) -> Result<StatResult, String> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StatResult::default()),
            Err(e) => return Err(format!("Unable to stat {path} ({e})")),
        };

        let last_modified_millis = metadata
            .modified()
            .map_err(|e| format!("Unable to stat {path} ({e})"))?
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));

        Ok(StatResult {
            exists: true,
            last_modified_millis,
        })
    }

    fn resolve(&self, path: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::from(path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }
}

/// Splits on runs of CR/LF, empty lines never appear in the output
pub fn split_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|b| *b == b'\r' || *b == b'\n')
        .filter(|line| !line.is_empty())
}
