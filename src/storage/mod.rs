//! Remote index storage abstraction.
//!
//! A table is a per-day bucket of index files in an object store. Files not
//! attributable to a single tenant live at the table root ("common" index);
//! per-tenant files live under a tenant-named prefix inside the table.

pub mod s3;

use std::path::Path;

use anyhow::Result;

/// A file within a remote table listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    /// Base name of the file, unique within its (table, user) scope.
    pub name: String,
}

impl FileRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Client for the object store holding index tables.
///
/// Listing calls may be served from a short-lived cache; `bypass_cache`
/// forces a fresh listing (sync uses it, query readiness does not).
#[async_trait::async_trait]
pub trait IndexStorageClient: Send + Sync {
    /// List the names of all tables in the store.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// List a table's common index files and the IDs of users that have
    /// dedicated index files in it.
    async fn list_files(
        &self,
        table_name: &str,
        bypass_cache: bool,
    ) -> Result<(Vec<FileRef>, Vec<String>)>;

    /// List one user's index files within a table.
    async fn list_user_files(
        &self,
        table_name: &str,
        user_id: &str,
        bypass_cache: bool,
    ) -> Result<Vec<FileRef>>;

    /// Download a common index file to `dest`.
    async fn download_file(&self, table_name: &str, file_name: &str, dest: &Path) -> Result<()>;

    /// Download a user's index file to `dest`.
    async fn download_user_file(
        &self,
        table_name: &str,
        user_id: &str,
        file_name: &str,
        dest: &Path,
    ) -> Result<()>;
}
