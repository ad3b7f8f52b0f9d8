//! 过期文件回收：删除内容与元数据。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::repository::ResourceRepository;
use crate::storage::ContentStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub retired: usize,
    /// Metadata removed while the content could not be deleted.
    pub orphaned: usize,
    /// Metadata that could not be removed; retried next cycle.
    pub failed: usize,
}

pub struct ExpiryReaper {
    repository: Arc<dyn ResourceRepository>,
    content: Arc<dyn ContentStore>,
    clock: Arc<dyn Clock>,
    period: Duration,
}

impl ExpiryReaper {
    pub fn new(
        repository: Arc<dyn ResourceRepository>,
        content: Arc<dyn ContentStore>,
        clock: Arc<dyn Clock>,
        period: Duration,
    ) -> Self {
        Self {
            repository,
            content,
            clock,
            period,
        }
    }

    /// 单轮回收。内容删除失败不阻止元数据删除，过期文件不会再被下载。
    pub async fn run_cycle(&self) -> ReapReport {
        let mut report = ReapReport::default();
        let expired = match self.repository.list_expired(self.clock.now()).await {
            Ok(expired) => expired,
            Err(err) => {
                warn!(error = ?err, "listing expired files failed");
                return report;
            }
        };

        for resource in expired {
            let content_removed = match self.content.delete(&resource.locator).await {
                Ok(_) => true,
                Err(err) => {
                    // 删除报错但内容已不存在时不算孤儿
                    let gone = matches!(self.content.exists(&resource.locator).await, Ok(false));
                    if !gone {
                        warn!(id = %resource.id, locator = resource.locator, error = ?err, "content delete failed");
                    }
                    gone
                }
            };
            match self.repository.delete(resource.id).await {
                Ok(_) if content_removed => report.retired += 1,
                Ok(_) => report.orphaned += 1,
                Err(err) => {
                    warn!(id = %resource.id, error = ?err, "metadata delete failed");
                    report.failed += 1;
                }
            }
        }

        if report == ReapReport::default() {
            debug!("reaper cycle found nothing to retire");
        } else {
            info!(
                retired = report.retired,
                orphaned = report.orphaned,
                failed = report.failed,
                "reaper cycle finished"
            );
        }
        report
    }

    /// Runs a cycle right away and then once per period until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.run_cycle().await;
                    }
                }
            }
            debug!("reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::AccountId;
    use crate::repository::tests::sample_resource;
    use crate::repository::{IndexedRepository, InsertOutcome};
    use crate::storage::{ContentReader, DiskStorage};
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    struct BrokenContent {
        still_present: bool,
    }

    #[async_trait]
    impl ContentStore for BrokenContent {
        async fn open(&self, _locator: &str) -> Result<Option<ContentReader>> {
            Ok(None)
        }

        async fn write(&self, _locator: &str, _reader: ContentReader, _limit: u64) -> Result<u64> {
            bail!("read-only")
        }

        async fn delete(&self, _locator: &str) -> Result<bool> {
            bail!("disk unplugged")
        }

        async fn exists(&self, _locator: &str) -> Result<bool> {
            Ok(self.still_present)
        }
    }

    #[tokio::test]
    async fn expired_files_are_retired_once() {
        let temp = tempdir().expect("tempdir");
        let storage = Arc::new(DiskStorage::new(temp.path().to_path_buf()));
        let repository = Arc::new(IndexedRepository::in_memory());
        let clock = Arc::new(ManualClock::starting_at_epoch());

        let old = sample_resource("OLD001", AccountId::new(), clock.now() - ChronoDuration::days(2));
        let fresh = sample_resource("NEW001", AccountId::new(), clock.now());
        for resource in [&old, &fresh] {
            std::fs::write(temp.path().join(&resource.locator), b"data").expect("seed content");
            let outcome = repository.try_insert(resource.clone()).await.expect("insert");
            assert_eq!(outcome, InsertOutcome::Inserted);
        }

        let reaper = ExpiryReaper::new(
            repository.clone(),
            storage.clone(),
            clock.clone(),
            Duration::from_secs(3600),
        );
        let report = reaper.run_cycle().await;
        assert_eq!(report.retired, 1);
        assert!(repository.find_by_id(old.id).await.expect("find").is_none());
        assert!(!storage.exists(&old.locator).await.expect("exists"));
        assert!(repository.find_by_id(fresh.id).await.expect("find").is_some());

        assert_eq!(reaper.run_cycle().await, ReapReport::default());
    }

    #[tokio::test]
    async fn content_failure_still_removes_metadata() {
        let repository = Arc::new(IndexedRepository::in_memory());
        let clock = Arc::new(ManualClock::starting_at_epoch());
        let old = sample_resource("OLD002", AccountId::new(), clock.now() - ChronoDuration::days(2));
        repository.try_insert(old.clone()).await.expect("insert");

        let reaper = ExpiryReaper::new(
            repository.clone(),
            Arc::new(BrokenContent { still_present: true }),
            clock,
            Duration::from_secs(3600),
        );
        let report = reaper.run_cycle().await;
        assert_eq!(report.orphaned, 1);
        assert_eq!(report.retired, 0);
        assert!(
            repository
                .find_by_access_code("OLD002")
                .await
                .expect("find")
                .is_none()
        );
    }

    #[tokio::test]
    async fn failed_delete_of_missing_content_counts_as_retired() {
        let repository = Arc::new(IndexedRepository::in_memory());
        let clock = Arc::new(ManualClock::starting_at_epoch());
        let old = sample_resource("GONE01", AccountId::new(), clock.now() - ChronoDuration::days(2));
        repository.try_insert(old).await.expect("insert");

        let reaper = ExpiryReaper::new(
            repository,
            Arc::new(BrokenContent { still_present: false }),
            clock,
            Duration::from_secs(3600),
        );
        let report = reaper.run_cycle().await;
        assert_eq!(report.retired, 1);
        assert_eq!(report.orphaned, 0);
    }

    #[tokio::test]
    async fn spawned_reaper_stops_on_cancel() {
        let repository = Arc::new(IndexedRepository::in_memory());
        let clock = Arc::new(ManualClock::starting_at_epoch());
        let old = sample_resource("OLD003", AccountId::new(), clock.now() - ChronoDuration::days(2));
        repository.try_insert(old.clone()).await.expect("insert");

        let reaper = Arc::new(ExpiryReaper::new(
            repository.clone(),
            Arc::new(BrokenContent { still_present: true }),
            clock,
            Duration::from_millis(10),
        ));
        let cancel = CancellationToken::new();
        let handle = reaper.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.expect("reaper task");

        assert!(repository.find_by_id(old.id).await.expect("find").is_none());
    }
}
