//! 文件内容存储：上传的字节按定位符平铺在存储目录下。

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::atomic::AtomicFile;

pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

/// 内容存储接口。
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Opens the blob, or `None` when it does not exist.
    async fn open(&self, locator: &str) -> Result<Option<ContentReader>>;

    /// 写入至多 `limit + 1` 字节并返回实际读取的字节数。
    async fn write(&self, locator: &str, reader: ContentReader, limit: u64) -> Result<u64>;

    /// 删除内容；返回删除前是否存在。
    async fn delete(&self, locator: &str) -> Result<bool>;

    async fn exists(&self, locator: &str) -> Result<bool>;
}

#[derive(Clone, Debug)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    #[cfg(test)]
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 定位符必须是单个普通路径段。
    fn resolve(&self, locator: &str) -> Result<PathBuf> {
        let mut components = Path::new(locator).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(segment)), None) if !locator.starts_with('.') => {
                Ok(self.root.join(segment))
            }
            _ => bail!("invalid content locator {locator:?}"),
        }
    }
}

#[async_trait]
impl ContentStore for DiskStorage {
    async fn open(&self, locator: &str) -> Result<Option<ContentReader>> {
        let path = self.resolve(locator)?;
        match File::open(&path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("open {}", path.display())),
        }
    }

    async fn write(&self, locator: &str, reader: ContentReader, limit: u64) -> Result<u64> {
        let path = self.resolve(locator)?;
        let mut atomic = AtomicFile::new(&path)
            .await
            .with_context(|| format!("create temp file for {}", path.display()))?;
        let mut limited = reader.take(limit.saturating_add(1));
        let written = match tokio::io::copy(&mut limited, atomic.file_mut()).await {
            Ok(written) => written,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err).context("stream upload body");
            }
        };
        if written > limit {
            atomic.cleanup().await;
            return Ok(written);
        }
        atomic
            .finalize()
            .await
            .with_context(|| format!("finalize {}", path.display()))?;
        Ok(written)
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        let path = self.resolve(locator)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
        }
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        let path = self.resolve(locator)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("stat {}", path.display()))
    }
}
