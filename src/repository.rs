//! 文件元数据仓库：内存索引，可选地以 JSON 形式持久化。

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::info;

use crate::atomic::write_atomic;
use crate::models::{AccountId, FileResource, ResourceId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    CodeTaken,
}

/// 元数据仓库接口。
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    async fn find_by_access_code(&self, code: &str) -> Result<Option<FileResource>>;

    async fn find_by_id(&self, id: ResourceId) -> Result<Option<FileResource>>;

    async fn exists_with_access_code(&self, code: &str) -> Result<bool>;

    /// Inserts unless a stored resource already holds the same access code.
    /// The check and the insert happen under one lock.
    async fn try_insert(&self, resource: FileResource) -> Result<InsertOutcome>;

    async fn delete(&self, id: ResourceId) -> Result<bool>;

    async fn list_expired(&self, before: DateTime<Utc>) -> Result<Vec<FileResource>>;

    /// 按创建时间倒序列出某账户的文件。
    async fn list_by_owner(&self, owner: AccountId) -> Result<Vec<FileResource>>;
}

#[derive(Default)]
struct Index {
    by_id: HashMap<ResourceId, FileResource>,
    by_code: HashMap<String, ResourceId>,
}

impl Index {
    fn insert(&mut self, resource: FileResource) {
        self.by_code.insert(resource.access_code.clone(), resource.id);
        self.by_id.insert(resource.id, resource);
    }
}

pub struct IndexedRepository {
    index: Mutex<Index>,
    index_path: Option<PathBuf>,
}

impl IndexedRepository {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            index: Mutex::new(Index::default()),
            index_path: None,
        }
    }

    /// 从索引文件加载；文件不存在时从空索引开始。
    pub async fn open(index_path: PathBuf) -> Result<Self> {
        let mut index = Index::default();
        match tokio::fs::read(&index_path).await {
            Ok(bytes) => {
                let resources: Vec<FileResource> = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parse {}", index_path.display()))?;
                for resource in resources {
                    index.insert(resource);
                }
                info!(
                    path = %index_path.display(),
                    count = index.by_id.len(),
                    "loaded file index"
                );
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", index_path.display()));
            }
        }
        Ok(Self {
            index: Mutex::new(index),
            index_path: Some(index_path),
        })
    }

    async fn persist(&self, index: &Index) -> Result<()> {
        let Some(path) = &self.index_path else {
            return Ok(());
        };
        let resources: Vec<&FileResource> = index.by_id.values().collect();
        let bytes = serde_json::to_vec(&resources)?;
        write_atomic(path, &bytes)
            .await
            .with_context(|| format!("write {}", path.display()))
    }
}

#[async_trait]
impl ResourceRepository for IndexedRepository {
    async fn find_by_access_code(&self, code: &str) -> Result<Option<FileResource>> {
        let index = self.index.lock().await;
        Ok(index
            .by_code
            .get(code)
            .and_then(|id| index.by_id.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: ResourceId) -> Result<Option<FileResource>> {
        let index = self.index.lock().await;
        Ok(index.by_id.get(&id).cloned())
    }

    async fn exists_with_access_code(&self, code: &str) -> Result<bool> {
        let index = self.index.lock().await;
        Ok(index.by_code.contains_key(code))
    }

    async fn try_insert(&self, resource: FileResource) -> Result<InsertOutcome> {
        let mut index = self.index.lock().await;
        if index.by_code.contains_key(&resource.access_code) {
            return Ok(InsertOutcome::CodeTaken);
        }
        let id = resource.id;
        index.insert(resource);
        if let Err(err) = self.persist(&index).await {
            if let Some(removed) = index.by_id.remove(&id) {
                index.by_code.remove(&removed.access_code);
            }
            return Err(err);
        }
        Ok(InsertOutcome::Inserted)
    }

    async fn delete(&self, id: ResourceId) -> Result<bool> {
        let mut index = self.index.lock().await;
        let Some(removed) = index.by_id.remove(&id) else {
            return Ok(false);
        };
        index.by_code.remove(&removed.access_code);
        if let Err(err) = self.persist(&index).await {
            index.insert(removed);
            return Err(err);
        }
        Ok(true)
    }

    async fn list_expired(&self, before: DateTime<Utc>) -> Result<Vec<FileResource>> {
        let index = self.index.lock().await;
        Ok(index
            .by_id
            .values()
            .filter(|resource| resource.expires_at < before)
            .cloned()
            .collect())
    }

    async fn list_by_owner(&self, owner: AccountId) -> Result<Vec<FileResource>> {
        let index = self.index.lock().await;
        let mut owned: Vec<FileResource> = index
            .by_id
            .values()
            .filter(|resource| resource.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }
}
