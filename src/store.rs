//! Persistence of the connected-server list.
//!
//! The format is one URI per line. Lines are trimmed, blank lines are
//! skipped and duplicates collapse to their first occurrence.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read session list {}: {}", .0.display(), .1)]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to write session list {}: {}", .0.display(), .1)]
    Write(PathBuf, #[source] std::io::Error),
}

/// Where the registry keeps the URIs it should reconnect to on startup.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Vec<String>, StoreError>;

    fn save(&self, uris: &[String]) -> Result<(), StoreError>;
}

/// Newline-delimited file. A missing file is an empty list.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Vec<String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(parse_lines(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::Read(self.path.clone(), e)),
        }
    }

    fn save(&self, uris: &[String]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Write(self.path.clone(), e))?;
        }
        let mut text = dedupe(uris.iter().map(String::as_str)).join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        std::fs::write(&self.path, text).map_err(|e| StoreError::Write(self.path.clone(), e))?;
        tracing::debug!(path = %self.path.display(), count = uris.len(), "session list saved");
        Ok(())
    }
}

/// Keeps the list in memory only.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    uris: Mutex<Vec<String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_uris<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            uris: Mutex::new(uris.into_iter().map(Into::into).collect()),
        }
    }

    pub fn uris(&self) -> Vec<String> {
        self.uris.lock().clone()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Vec<String>, StoreError> {
        Ok(dedupe(self.uris.lock().iter().map(String::as_str)))
    }

    fn save(&self, uris: &[String]) -> Result<(), StoreError> {
        *self.uris.lock() = dedupe(uris.iter().map(String::as_str));
        Ok(())
    }
}

pub(crate) fn parse_lines(text: &str) -> Vec<String> {
    dedupe(text.lines())
}

fn dedupe<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    lines
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(*line))
        .map(str::to_string)
        .collect()
}
