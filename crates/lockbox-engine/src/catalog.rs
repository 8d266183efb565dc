//! File catalog: the persisted list of converted files.
//!
//! `JsonCatalog` keeps no state in memory between calls. Every write loads the
//! file, mutates it and writes it back through a temp file + rename, so a
//! reader never sees a half-written catalog and no write lock is held between
//! operations.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lockbox_core::{CatalogError, FileDescriptor};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where completed conversions are recorded
pub trait Catalog: Send + Sync {
    /// Persist `entry` and return its newly assigned id.
    fn add_entry(&self, entry: &FileDescriptor) -> Result<i64, CatalogError>;

    fn delete_entry(&self, id: i64) -> Result<(), CatalogError>;

    /// All entries, oldest first
    fn list_entries(&self) -> Result<Vec<FileDescriptor>, CatalogError>;

    fn get(&self, id: i64) -> Result<FileDescriptor, CatalogError> {
        self.list_entries()?
            .into_iter()
            .find(|e| e.id == Some(id))
            .ok_or(CatalogError::NotFound(id))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    /// Next id to hand out; ids are never reused
    #[serde(default = "first_id")]
    next_id: i64,
    #[serde(default)]
    entries: Vec<FileDescriptor>,
}

fn first_id() -> i64 {
    1
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CatalogError {
    let path = path.to_path_buf();
    move |source| CatalogError::Io { path, source }
}

pub struct JsonCatalog {
    path: PathBuf,
    /// Serialises read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl JsonCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<CatalogFile, CatalogError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CatalogFile {
                    next_id: first_id(),
                    entries: Vec::new(),
                })
            }
            Err(source) => {
                return Err(CatalogError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| CatalogError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, file: &CatalogFile) -> Result<(), CatalogError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }

        let json = serde_json::to_string_pretty(file).map_err(|source| CatalogError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, json).map_err(io_err(&tmp_path))?;
        std::fs::rename(&tmp_path, &self.path).map_err(io_err(&self.path))?;
        Ok(())
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut CatalogFile) -> Result<T, CatalogError>,
    ) -> Result<T, CatalogError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.load()?;
        let out = f(&mut file)?;
        self.store(&file)?;
        Ok(out)
    }
}

impl Catalog for JsonCatalog {
    fn add_entry(&self, entry: &FileDescriptor) -> Result<i64, CatalogError> {
        let id = self.mutate(|file| {
            let id = file.next_id;
            file.next_id += 1;
            let mut entry = entry.clone();
            entry.id = Some(id);
            file.entries.push(entry);
            Ok(id)
        })?;
        debug!(id, name = %entry.display_name, "catalog entry added");
        Ok(id)
    }

    fn delete_entry(&self, id: i64) -> Result<(), CatalogError> {
        self.mutate(|file| {
            let before = file.entries.len();
            file.entries.retain(|e| e.id != Some(id));
            if file.entries.len() == before {
                return Err(CatalogError::NotFound(id));
            }
            Ok(())
        })?;
        debug!(id, "catalog entry deleted");
        Ok(())
    }

    fn list_entries(&self) -> Result<Vec<FileDescriptor>, CatalogError> {
        Ok(self.load()?.entries)
    }
}
