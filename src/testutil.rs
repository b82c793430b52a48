//! In-memory storage client for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use crate::index::{open_raw_index_file, OpenIndexFileFn};
use crate::storage::{FileRef, IndexStorageClient};

/// The default open function, boxed for injection.
pub fn raw_open_fn() -> OpenIndexFileFn {
    Arc::new(open_raw_index_file)
}

/// An [`IndexStorageClient`] over in-memory listings that counts calls and
/// downloads. Downloaded files are written with a fixed non-empty payload.
#[derive(Default)]
pub struct MockStorage {
    tables: Mutex<HashMap<String, MockTable>>,
    list_tables_calls: AtomicUsize,
    /// Downloads per (table, user, file); user is empty for common files.
    downloads: Mutex<HashMap<(String, String, String), usize>>,
    download_delay: Mutex<Duration>,
    fail_downloads: AtomicBool,
}

#[derive(Default, Clone)]
struct MockTable {
    common: Vec<String>,
    users: HashMap<String, Vec<String>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_common_file(&self, table: &str, file: &str) {
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(table.to_string())
            .or_default()
            .common
            .push(file.to_string());
    }

    pub fn add_user_file(&self, table: &str, user: &str, file: &str) {
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(table.to_string())
            .or_default()
            .users
            .entry(user.to_string())
            .or_default()
            .push(file.to_string());
    }

    pub fn remove_user_file(&self, table: &str, user: &str, file: &str) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(t) = tables.get_mut(table) {
            if let Some(files) = t.users.get_mut(user) {
                files.retain(|f| f != file);
            }
        }
    }

    pub fn set_download_delay(&self, delay: Duration) {
        *self.download_delay.lock().unwrap() = delay;
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::Relaxed);
    }

    pub fn list_tables_calls(&self) -> usize {
        self.list_tables_calls.load(Ordering::Relaxed)
    }

    pub fn downloads(&self, table: &str, user: &str, file: &str) -> usize {
        self.downloads
            .lock()
            .unwrap()
            .get(&(table.to_string(), user.to_string(), file.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_downloads(&self) -> usize {
        self.downloads.lock().unwrap().values().sum()
    }

    fn file_exists(&self, table: &str, user: &str, file: &str) -> bool {
        let tables = self.tables.lock().unwrap();
        let Some(t) = tables.get(table) else {
            return false;
        };
        if user.is_empty() {
            t.common.iter().any(|f| f == file)
        } else {
            t.users
                .get(user)
                .is_some_and(|files| files.iter().any(|f| f == file))
        }
    }

    async fn download(&self, table: &str, user: &str, file: &str, dest: &Path) -> Result<()> {
        let delay = *self.download_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_downloads.load(Ordering::Relaxed) {
            bail!("storage unavailable");
        }
        if !self.file_exists(table, user, file) {
            bail!("no such remote file {table}/{user}/{file}");
        }
        *self
            .downloads
            .lock()
            .unwrap()
            .entry((table.to_string(), user.to_string(), file.to_string()))
            .or_insert(0) += 1;
        tokio::fs::write(dest, b"index-data").await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl IndexStorageClient for MockStorage {
    async fn list_tables(&self) -> Result<Vec<String>> {
        self.list_tables_calls.fetch_add(1, Ordering::Relaxed);
        let mut names: Vec<String> = self.tables.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn list_files(
        &self,
        table_name: &str,
        _bypass_cache: bool,
    ) -> Result<(Vec<FileRef>, Vec<String>)> {
        let tables = self.tables.lock().unwrap();
        let Some(table) = tables.get(table_name) else {
            return Ok((Vec::new(), Vec::new()));
        };
        let files = table.common.iter().map(FileRef::new).collect();
        let mut user_ids: Vec<String> = table.users.keys().cloned().collect();
        user_ids.sort();
        Ok((files, user_ids))
    }

    async fn list_user_files(
        &self,
        table_name: &str,
        user_id: &str,
        _bypass_cache: bool,
    ) -> Result<Vec<FileRef>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(table_name)
            .and_then(|table| table.users.get(user_id))
            .map(|files| files.iter().map(FileRef::new).collect())
            .unwrap_or_default())
    }

    async fn download_file(&self, table_name: &str, file_name: &str, dest: &Path) -> Result<()> {
        self.download(table_name, "", file_name, dest).await
    }

    async fn download_user_file(
        &self,
        table_name: &str,
        user_id: &str,
        file_name: &str,
        dest: &Path,
    ) -> Result<()> {
        self.download(table_name, user_id, file_name, dest).await
    }
}
