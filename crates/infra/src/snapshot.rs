//! Whole-file JSON snapshots with atomic replacement.
//!
//! Every save rewrites the complete record list: serialize, write to a temp
//! file in the target directory, `sync_all`, then rename over the old file.
//! Readers never observe a half-written snapshot.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use outreach_core::Entity;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot {path} is malformed: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SnapshotError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A JSON array of records persisted as one file.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record. A missing file is an empty snapshot.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>, SnapshotError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SnapshotError::io(&self.path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|source| SnapshotError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    pub fn save<T: Serialize>(&self, records: &[T]) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(records)?;
        write_atomic(&self.path, &bytes)
    }
}

/// Replace `path` with `bytes` atomically. Parent directories are created (0700),
/// the file itself ends up 0600.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    create_private_dir(dir)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| SnapshotError::io(path, e))?;
    tmp.write_all(bytes).map_err(|e| SnapshotError::io(path, e))?;
    restrict_permissions(tmp.as_file()).map_err(|e| SnapshotError::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| SnapshotError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| SnapshotError::io(path, e.error))?;
    Ok(())
}

/// In-memory record list mirrored to an optional [`SnapshotFile`].
///
/// Without a file the table behaves the same but nothing survives a restart.
#[derive(Debug)]
pub struct SnapshotTable<T> {
    file: Option<SnapshotFile>,
    rows: RwLock<Vec<T>>,
}

impl<T> SnapshotTable<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    pub fn in_memory() -> Self {
        Self {
            file: None,
            rows: RwLock::new(Vec::new()),
        }
    }

    pub fn open(file: SnapshotFile) -> Result<Self, SnapshotError> {
        let rows = file.load()?;
        Ok(Self {
            file: Some(file),
            rows: RwLock::new(rows),
        })
    }

    #[cfg(test)]
    pub fn is_durable(&self) -> bool {
        self.file.is_some()
    }

    pub fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        f(&rows)
    }

    /// Mutate without writing the snapshot.
    pub fn update_in_memory<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut rows)
    }

    /// Mutate and persist. If the write fails the previous rows are restored.
    pub fn update<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> Result<R, SnapshotError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let Some(file) = &self.file else {
            return Ok(f(&mut rows));
        };

        let before = rows.clone();
        let out = f(&mut rows);
        if let Err(e) = file.save(&rows) {
            *rows = before;
            return Err(e);
        }
        Ok(out)
    }

    /// Write the current rows, keeping them in memory even if the write fails.
    pub fn persist(&self) -> Result<(), SnapshotError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        match &self.file {
            Some(file) => file.save(&rows),
            None => Ok(()),
        }
    }
}

impl<T> SnapshotTable<T>
where
    T: Entity + Clone + Serialize + DeserializeOwned,
{
    pub fn find(&self, id: &T::Id) -> Option<T> {
        self.read(|rows| rows.iter().find(|r| r.id() == id).cloned())
    }
}

fn create_private_dir(dir: &Path) -> Result<(), SnapshotError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| SnapshotError::io(dir, e))
}

#[cfg(unix)]
fn restrict_permissions(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &fs::File) -> io::Result<()> {
    Ok(())
}
