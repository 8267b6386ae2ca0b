//! Resource persistence gateway
//!
//! Connectors must record every provider-side resource they discover or
//! create before returning from a mutating operation, including on the
//! failure path, so retried operations never lose track of provider
//! artifacts. The gateway is the lifetime authority for resource records;
//! save/delete are idempotent and keyed by (stack, resource type + name).

use crate::context::CloudContext;
use crate::error::{CloudError, Result};
use crate::model::CloudResource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;

/// Durable record of which provider-side resources exist for a stack.
#[async_trait]
pub trait PersistenceNotifier: Send + Sync {
    async fn save_resources(&self, context: &CloudContext, resources: &[CloudResource])
    -> Result<()>;

    async fn delete_resources(
        &self,
        context: &CloudContext,
        resources: &[CloudResource],
    ) -> Result<()>;
}

/// One persisted resource record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource: CloudResource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn record_key(context: &CloudContext, resource: &CloudResource) -> String {
    format!("{}:{}", context.id, resource.key())
}

/// In-memory gateway used by tests and callers that keep their own durable
/// store.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    records: Mutex<HashMap<String, ResourceRecord>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records currently held for a stack.
    pub fn resources_for(&self, context: &CloudContext) -> Vec<CloudResource> {
        let prefix = format!("{}:", context.id);
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, r)| r.resource.clone())
            .collect()
    }
}

#[async_trait]
impl PersistenceNotifier for InMemoryNotifier {
    async fn save_resources(
        &self,
        context: &CloudContext,
        resources: &[CloudResource],
    ) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| CloudError::Persistence(e.to_string()))?;
        let now = Utc::now();
        for resource in resources {
            let key = record_key(context, resource);
            records
                .entry(key)
                .and_modify(|r| {
                    r.resource = resource.clone();
                    r.updated_at = now;
                })
                .or_insert_with(|| ResourceRecord {
                    resource: resource.clone(),
                    created_at: now,
                    updated_at: now,
                });
        }
        Ok(())
    }

    async fn delete_resources(
        &self,
        context: &CloudContext,
        resources: &[CloudResource],
    ) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| CloudError::Persistence(e.to_string()))?;
        for resource in resources {
            records.remove(&record_key(context, resource));
        }
        Ok(())
    }
}

const BOOK_VERSION: u32 = 1;
const BOOK_FILE: &str = "resources.json";
const BOOK_BACKUP: &str = "resources.json.backup";

/// On-disk layout of the resource book.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResourceBook {
    version: u32,
    updated_at: DateTime<Utc>,
    records: HashMap<String, ResourceRecord>,
}

impl Default for ResourceBook {
    fn default() -> Self {
        Self {
            version: BOOK_VERSION,
            updated_at: Utc::now(),
            records: HashMap::new(),
        }
    }
}

/// File-backed gateway: a JSON book under the given directory, written with
/// a backup of the previous version. Suitable for single-process use; the
/// caller serializes concurrent calls for the same stack.
pub struct FileNotifier {
    directory: PathBuf,
}

impl FileNotifier {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    fn book_path(&self) -> PathBuf {
        self.directory.join(BOOK_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.directory.join(BOOK_BACKUP)
    }

    async fn load(&self) -> Result<ResourceBook> {
        let path = self.book_path();
        if !path.exists() {
            tracing::debug!("resource book not found, starting empty");
            return Ok(ResourceBook::default());
        }
        let content = fs::read_to_string(&path).await?;
        let book: ResourceBook = serde_json::from_str(&content)?;
        if book.version > BOOK_VERSION {
            return Err(CloudError::Persistence(format!(
                "resource book version {} is newer than supported version {}",
                book.version, BOOK_VERSION
            )));
        }
        Ok(book)
    }

    async fn store(&self, book: &ResourceBook) -> Result<()> {
        if !self.directory.exists() {
            fs::create_dir_all(&self.directory).await?;
        }
        let path = self.book_path();
        let backup = self.backup_path();
        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
        }
        let content = serde_json::to_string_pretty(book)?;
        fs::write(&path, content).await?;
        tracing::debug!("resource book saved with {} records", book.records.len());
        Ok(())
    }

    /// Records currently held for a stack.
    pub async fn resources_for(&self, context: &CloudContext) -> Result<Vec<CloudResource>> {
        let book = self.load().await?;
        let prefix = format!("{}:", context.id);
        Ok(book
            .records
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, r)| r.resource.clone())
            .collect())
    }
}

#[async_trait]
impl PersistenceNotifier for FileNotifier {
    async fn save_resources(
        &self,
        context: &CloudContext,
        resources: &[CloudResource],
    ) -> Result<()> {
        let mut book = self.load().await?;
        let now = Utc::now();
        for resource in resources {
            let key = record_key(context, resource);
            book.records
                .entry(key)
                .and_modify(|r| {
                    r.resource = resource.clone();
                    r.updated_at = now;
                })
                .or_insert_with(|| ResourceRecord {
                    resource: resource.clone(),
                    created_at: now,
                    updated_at: now,
                });
        }
        book.updated_at = now;
        self.store(&book).await
    }

    async fn delete_resources(
        &self,
        context: &CloudContext,
        resources: &[CloudResource],
    ) -> Result<()> {
        let mut book = self.load().await?;
        for resource in resources {
            book.records.remove(&record_key(context, resource));
        }
        book.updated_at = Utc::now();
        self.store(&book).await
    }
}
