//! 下载审计：只追加，不修改。

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::models::{AccountId, DownloadRecord};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: DownloadRecord) -> Result<()>;

    /// 某账户的下载历史，最新的在前。
    async fn for_account(&self, account: AccountId) -> Result<Vec<DownloadRecord>>;
}

/// Keeps records in memory and, when configured, mirrors each one as a JSON
/// line so history outlives the process.
pub struct DownloadLog {
    records: Mutex<Vec<DownloadRecord>>,
    journal: Option<PathBuf>,
}

impl DownloadLog {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            journal: None,
        }
    }

    /// 从 JSON Lines 日志恢复；损坏的行会被跳过。
    pub async fn open(journal: PathBuf) -> Result<Self> {
        let mut records = Vec::new();
        match tokio::fs::read_to_string(&journal).await {
            Ok(contents) => {
                for line in contents.lines().filter(|line| !line.trim().is_empty()) {
                    match serde_json::from_str::<DownloadRecord>(line) {
                        Ok(record) => records.push(record),
                        Err(err) => tracing::warn!(error = %err, "skipping corrupt audit line"),
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("read {}", journal.display())),
        }
        Ok(Self {
            records: Mutex::new(records),
            journal: Some(journal),
        })
    }
}

#[async_trait]
impl AuditSink for DownloadLog {
    async fn append(&self, record: DownloadRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        if let Some(path) = &self.journal {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("open {}", path.display()))?;
            file.write_all(&line).await?;
            file.flush().await?;
        }
        records.push(record);
        Ok(())
    }

    async fn for_account(&self, account: AccountId) -> Result<Vec<DownloadRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .rev()
            .filter(|record| record.account == Some(account))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessChannel, ResourceId};
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn record(account: Option<AccountId>, name: &str, minutes_ago: i64) -> DownloadRecord {
        DownloadRecord {
            account,
            resource: ResourceId::new(),
            original_name: name.to_string(),
            downloaded_at: Utc::now() - Duration::minutes(minutes_ago),
            origin: None,
            email: Some("a@x.com".to_string()),
            channel: AccessChannel::Code,
        }
    }

    #[tokio::test]
    async fn history_is_newest_first_and_scoped() {
        let log = DownloadLog::in_memory();
        let alice = AccountId::new();
        log.append(record(Some(alice), "first.txt", 10)).await.expect("append");
        log.append(record(None, "anon.txt", 5)).await.expect("append");
        log.append(record(Some(alice), "second.txt", 1)).await.expect("append");

        let history = log.for_account(alice).await.expect("history");
        let names: Vec<&str> = history.iter().map(|r| r.original_name.as_str()).collect();
        assert_eq!(names, vec!["second.txt", "first.txt"]);
    }

    #[tokio::test]
    async fn journal_is_replayed_on_open() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("downloads.jsonl");
        let alice = AccountId::new();
        {
            let log = DownloadLog::open(path.clone()).await.expect("open");
            log.append(record(Some(alice), "kept.txt", 1)).await.expect("append");
        }
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut file| std::io::Write::write_all(&mut file, b"not json\n"))
            .expect("corrupt line");

        let reopened = DownloadLog::open(path).await.expect("reopen");
        let history = reopened.for_account(alice).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].original_name, "kept.txt");
    }
}
