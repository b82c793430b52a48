//! Open-index abstraction.
//!
//! The cache manager stores index files on disk but does not understand
//! their format. The query layer supplies an [`OpenIndexFileFn`] that turns
//! a downloaded file into an [`OpenIndex`]; the manager keeps these objects
//! alive while the file is cached and hands them to read callbacks.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

// ---------------------------------------------------------------------------
// Traits and callback types
// ---------------------------------------------------------------------------

/// An index file opened for reading.
///
/// Dropping the object releases the underlying file resources; the on-disk
/// file itself is owned by the cache and removed separately.
pub trait OpenIndex: Send + Sync {
    /// Base name of the file, as it appears in remote storage.
    fn name(&self) -> &str;

    /// Full local path of the opened file.
    fn path(&self) -> &Path;
}

/// Opens a downloaded index file.
///
/// Errors surface conditions like truncated or corrupt files; the caller
/// propagates them without retrying.
pub type OpenIndexFileFn = Arc<dyn Fn(&Path) -> Result<Box<dyn OpenIndex>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Default file-backed implementation
// ---------------------------------------------------------------------------

/// An [`OpenIndex`] that holds a plain read-only file handle.
pub struct RawIndexFile {
    name: String,
    path: PathBuf,
    _file: File,
}

impl OpenIndex for RawIndexFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Open an index file without interpreting its contents.
///
/// Rejects zero-length files: a previous process may have crashed mid-write,
/// and an empty index is never valid.
pub fn open_raw_index_file(path: &Path) -> Result<Box<dyn OpenIndex>> {
    let file =
        File::open(path).with_context(|| format!("open index file {}", path.display()))?;
    let metadata = file
        .metadata()
        .with_context(|| format!("stat index file {}", path.display()))?;
    anyhow::ensure!(
        metadata.len() > 0,
        "index file {} is empty",
        path.display()
    );

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Box::new(RawIndexFile {
        name,
        path: path.to_path_buf(),
        _file: file,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert!(open_raw_index_file(&path).is_err());
    }

    #[test]
    fn open_reads_name_and_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index-0001");
        std::fs::write(&path, b"data").unwrap();
        let idx = open_raw_index_file(&path).unwrap();
        assert_eq!(idx.name(), "index-0001");
        assert_eq!(idx.path(), path);
    }
}
