//! 后台任务：过期文件回收、验证码与链接清理、会话清理。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::{AuthConfig, prune_expired_sessions, prune_login_attempts};
use crate::challenge::ChallengeStore;
use crate::config::{CHALLENGE_PRUNE_INTERVAL_SECS, SESSION_PRUNE_INTERVAL_SECS};
use crate::links::SharingLinkStore;
use crate::reaper::ExpiryReaper;

/// Tasks started with the server and stopped with it.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// 启动全部后台任务。
    pub fn spawn(
        reaper: Arc<ExpiryReaper>,
        challenges: Arc<dyn ChallengeStore>,
        links: Arc<dyn SharingLinkStore>,
        auth: Arc<AuthConfig>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut handles = vec![reaper.spawn(cancel.child_token())];

        handles.push(every(
            Duration::from_secs(CHALLENGE_PRUNE_INTERVAL_SECS),
            cancel.child_token(),
            move || {
                let challenges = challenges.clone();
                let links = links.clone();
                async move {
                    match challenges.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "expired challenges purged"),
                        Err(err) => warn!(error = %err, "challenge purge failed"),
                    }
                    match links.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "expired links purged"),
                        Err(err) => warn!(error = %err, "link purge failed"),
                    }
                }
            },
        ));

        handles.push(every(
            Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS),
            cancel.child_token(),
            move || {
                let auth = auth.clone();
                async move {
                    prune_expired_sessions(&auth).await;
                    prune_login_attempts(&auth).await;
                }
            },
        ));

        Self { cancel, handles }
    }

    /// 通知所有任务退出并等待结束。
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
    }
}

fn every<F, Fut>(period: Duration, cancel: CancellationToken, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => job().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{ChallengeKey, MemoryChallengeStore};
    use crate::clock::ManualClock;
    use crate::codegen::ScriptedGenerator;
    use crate::links::{LinkPolicy, MemoryLinkStore};
    use crate::repository::IndexedRepository;
    use crate::storage::DiskStorage;

    #[tokio::test]
    async fn tasks_purge_and_stop_on_shutdown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::starting_at_epoch());
        let generator = Arc::new(ScriptedGenerator::default());
        let challenges = Arc::new(MemoryChallengeStore::new(clock.clone(), generator.clone(), 5));
        let links = Arc::new(MemoryLinkStore::new(
            clock.clone(),
            generator,
            LinkPolicy {
                id_length: 8,
                max_ttl_minutes: 1440,
                otp_ttl: chrono::Duration::minutes(5),
                max_attempts: 5,
            },
        ));
        let key = ChallengeKey::download("a@x.com", "AB12CD");
        let secret = challenges
            .issue(key.clone(), chrono::Duration::minutes(5))
            .await
            .expect("issue");
        clock.advance(chrono::Duration::minutes(6));

        let reaper = Arc::new(ExpiryReaper::new(
            Arc::new(IndexedRepository::in_memory()),
            Arc::new(DiskStorage::new(temp.path().to_path_buf())),
            clock.clone(),
            Duration::from_secs(3600),
        ));
        let auth = Arc::new(AuthConfig::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            5,
            Duration::from_secs(60),
        ));
        let tasks = BackgroundTasks::spawn(reaper, challenges.clone(), links, auth);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tasks.shutdown().await;

        let result = challenges.verify(&key, &secret).await;
        assert!(matches!(
            result,
            Err(crate::error::AccessError::NotFound(_))
        ));
    }
}
