//! Persistence backends for the entity cache
//!
//! A backend stores the whole cache as one snapshot: a flat JSON array of
//! [`CacheEntry`] records. Snapshots are loaded once at startup and rewritten
//! after every mutation.

use super::CacheEntry;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Cache persistence errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache storage is corrupt: {0}")]
    Corrupt(String),
}

/// Durable storage for cache snapshots
pub trait CacheBackend: Send + Sync {
    /// Read the last saved snapshot; a store that was never written is empty
    fn load(&self) -> Result<Vec<CacheEntry>, CacheError>;

    /// Replace the stored snapshot
    fn save(&self, entries: &[CacheEntry]) -> Result<(), CacheError>;
}

/// Single JSON file, replaced atomically through a temporary sibling
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl CacheBackend for JsonFileBackend {
    fn load(&self) -> Result<Vec<CacheEntry>, CacheError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|e| CacheError::Corrupt(e.to_string()))
    }

    fn save(&self, entries: &[CacheEntry]) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| CacheError::Corrupt(format!("Failed to serialize cache: {}", e)))?;

        // Write to temp file first, then rename over the old snapshot
        let temp_path = self.temp_path();
        {
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp_path, &self.path)?;

        tracing::debug!(
            "Saved {} cache entries to {}",
            entries.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// In-process backend; nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryBackend {
    snapshot: Mutex<Vec<CacheEntry>>,
    saves: Mutex<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot
    pub fn with_entries(entries: Vec<CacheEntry>) -> Self {
        Self {
            snapshot: Mutex::new(entries),
            saves: Mutex::new(0),
        }
    }

    /// Number of snapshots written so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl CacheBackend for MemoryBackend {
    fn load(&self) -> Result<Vec<CacheEntry>, CacheError> {
        Ok(self.snapshot())
    }

    fn save(&self, entries: &[CacheEntry]) -> Result<(), CacheError> {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = entries.to_vec();
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
