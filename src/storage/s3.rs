//! S3-backed [`IndexStorageClient`].
//!
//! Remote layout mirrors the on-disk cache layout: common index files live
//! at `{prefix}{table}/{file}` and per-tenant files at
//! `{prefix}{table}/{user}/{file}`. Table listings are fetched with one
//! recursive `ListObjectsV2` sweep and bucketed into common and per-user
//! files; the result is cached for a short TTL because query readiness
//! re-lists every table on every pass.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use aws_sdk_s3::Client;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::{FileRef, IndexStorageClient};

/// How long a per-table listing may be served from cache. `bypass_cache`
/// listings ignore this and refresh the entry.
const LIST_CACHE_TTL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// High-level wrapper around an S3 bucket holding index tables.
pub struct S3IndexStorage {
    client: Client,
    bucket: String,
    prefix: String,
    list_cache: Mutex<HashMap<String, TableListing>>,
}

#[derive(Clone)]
struct TableListing {
    fetched_at: Instant,
    files: Vec<FileRef>,
    user_files: HashMap<String, Vec<FileRef>>,
}

impl S3IndexStorage {
    /// Create a new `S3IndexStorage` from an already-configured `Client`.
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
            list_cache: Mutex::new(HashMap::new()),
        }
    }

    fn table_prefix(&self, table_name: &str) -> String {
        format!("{}{}/", self.prefix, table_name)
    }

    fn file_key(&self, table_name: &str, file_name: &str) -> String {
        format!("{}{}/{}", self.prefix, table_name, file_name)
    }

    fn user_file_key(&self, table_name: &str, user_id: &str, file_name: &str) -> String {
        format!("{}{}/{}/{}", self.prefix, table_name, user_id, file_name)
    }

    /// List all object keys under `prefix`, paginating through all results.
    #[instrument(skip(self), fields(%prefix))]
    async fn list_all_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(ref token) = continuation_token {
                req = req.continuation_token(token);
            }

            let resp = req.send().await.context("S3 ListObjectsV2")?;

            for obj in resp.contents() {
                if let Some(k) = obj.key() {
                    keys.push(k.to_string());
                }
            }

            match resp.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    /// Fetch a table's full listing from S3 and bucket it into common and
    /// per-user files.
    #[instrument(skip(self), fields(%table_name))]
    async fn fetch_table_listing(&self, table_name: &str) -> Result<TableListing> {
        let table_prefix = self.table_prefix(table_name);
        let keys = self.list_all_keys(&table_prefix).await?;

        let mut files = Vec::new();
        let mut user_files: HashMap<String, Vec<FileRef>> = HashMap::new();

        for key in &keys {
            let Some(rel) = key.strip_prefix(&table_prefix) else {
                continue;
            };
            match rel.split_once('/') {
                None if !rel.is_empty() => files.push(FileRef::new(rel)),
                Some((user_id, file_name)) if !user_id.is_empty() && !file_name.is_empty() => {
                    user_files
                        .entry(user_id.to_string())
                        .or_default()
                        .push(FileRef::new(file_name));
                }
                _ => {}
            }
        }

        debug!(
            table = table_name,
            common_files = files.len(),
            users = user_files.len(),
            "listed table"
        );

        Ok(TableListing {
            fetched_at: Instant::now(),
            files,
            user_files,
        })
    }

    /// Return the table's listing, served from cache when it is fresh
    /// enough and `bypass_cache` is not set.
    async fn table_listing(&self, table_name: &str, bypass_cache: bool) -> Result<TableListing> {
        if !bypass_cache {
            let cache = self.list_cache.lock().await;
            if let Some(listing) = cache.get(table_name) {
                if listing.fetched_at.elapsed() < LIST_CACHE_TTL {
                    return Ok(listing.clone());
                }
            }
        }

        let listing = self.fetch_table_listing(table_name).await?;
        self.list_cache
            .lock()
            .await
            .insert(table_name.to_string(), listing.clone());
        Ok(listing)
    }

    /// Download an S3 object to a local file.
    #[instrument(skip(self), fields(%key))]
    async fn download_object(&self, key: &str, dest: &Path) -> Result<()> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("S3 GetObject")?;

        let bytes = resp
            .body
            .collect()
            .await
            .context("read S3 GetObject body")?
            .into_bytes();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create parent dirs for {}", dest.display()))?;
        }

        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("write downloaded index file to {}", dest.display()))?;

        debug!(path = %dest.display(), bytes = bytes.len(), "index file downloaded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IndexStorageClient
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl IndexStorageClient for S3IndexStorage {
    #[instrument(skip(self))]
    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut tables = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .delimiter("/");

            if let Some(ref token) = continuation_token {
                req = req.continuation_token(token);
            }

            let resp = req.send().await.context("S3 ListObjectsV2 tables")?;

            for cp in resp.common_prefixes() {
                if let Some(p) = cp.prefix() {
                    let table = p
                        .strip_prefix(&self.prefix)
                        .unwrap_or(p)
                        .trim_end_matches('/');
                    if !table.is_empty() {
                        tables.push(table.to_string());
                    }
                }
            }

            match resp.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(count = tables.len(), "listed tables");
        Ok(tables)
    }

    async fn list_files(
        &self,
        table_name: &str,
        bypass_cache: bool,
    ) -> Result<(Vec<FileRef>, Vec<String>)> {
        let listing = self.table_listing(table_name, bypass_cache).await?;
        let mut user_ids: Vec<String> = listing.user_files.keys().cloned().collect();
        user_ids.sort();
        Ok((listing.files, user_ids))
    }

    async fn list_user_files(
        &self,
        table_name: &str,
        user_id: &str,
        bypass_cache: bool,
    ) -> Result<Vec<FileRef>> {
        let listing = self.table_listing(table_name, bypass_cache).await?;
        Ok(listing.user_files.get(user_id).cloned().unwrap_or_default())
    }

    async fn download_file(&self, table_name: &str, file_name: &str, dest: &Path) -> Result<()> {
        let key = self.file_key(table_name, file_name);
        self.download_object(&key, dest).await
    }

    async fn download_user_file(
        &self,
        table_name: &str,
        user_id: &str,
        file_name: &str,
        dest: &Path,
    ) -> Result<()> {
        let key = self.user_file_key(table_name, user_id, file_name);
        self.download_object(&key, dest).await
    }
}
