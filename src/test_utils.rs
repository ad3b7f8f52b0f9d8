//! 测试公用的装配与桩实现。

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use crate::access::{AccessControlService, AccessPolicy, Collaborators};
use crate::audit::DownloadLog;
use crate::challenge::MemoryChallengeStore;
use crate::clock::ManualClock;
use crate::codegen::ScriptedGenerator;
use crate::links::{LinkPolicy, MemoryLinkStore};
use crate::models::{AccountId, FileResource};
use crate::notify::Notifier;
use crate::repository::IndexedRepository;
use crate::storage::{ContentReader, DiskStorage};

#[derive(Clone, Debug)]
pub struct SentMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Records outgoing mail; can be told to fail the next delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentMessage>>,
    fail_next: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn last(&self) -> Option<SentMessage> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .cloned()
    }

    pub fn fail_next(&self) {
        *self.fail_next.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let fail = std::mem::take(
            &mut *self.fail_next.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        if fail {
            bail!("relay unavailable");
        }
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SentMessage {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
        Ok(())
    }
}

pub fn default_policy() -> AccessPolicy {
    AccessPolicy {
        otp_ttl: chrono::Duration::minutes(5),
        resource_lifetime: chrono::Duration::hours(24),
        access_code_length: 6,
        max_upload_size: 20 * 1024 * 1024,
        allowed_types: Vec::new(),
    }
}

/// 基于临时目录与手动时钟装配的完整服务。
pub struct Harness {
    pub service: Arc<AccessControlService>,
    pub storage: Arc<DiskStorage>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub generator: Arc<ScriptedGenerator>,
    _temp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(|_| {})
    }

    pub fn with_policy(adjust: impl FnOnce(&mut AccessPolicy)) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("files");
        std::fs::create_dir_all(&root).expect("create storage root");

        let clock = Arc::new(ManualClock::starting_at_epoch());
        let generator = Arc::new(ScriptedGenerator::default());
        let repository = Arc::new(IndexedRepository::in_memory());
        let storage = Arc::new(DiskStorage::new(root));
        let challenges = Arc::new(MemoryChallengeStore::new(clock.clone(), generator.clone(), 5));
        let links = Arc::new(MemoryLinkStore::new(
            clock.clone(),
            generator.clone(),
            LinkPolicy {
                id_length: 8,
                max_ttl_minutes: 1440,
                otp_ttl: chrono::Duration::minutes(5),
                max_attempts: 5,
            },
        ));
        let notifier = Arc::new(RecordingNotifier::default());

        let mut policy = default_policy();
        adjust(&mut policy);
        let service = Arc::new(AccessControlService::new(
            Collaborators {
                repository,
                content: storage.clone(),
                challenges,
                links,
                notifier: notifier.clone(),
                audit: Arc::new(DownloadLog::in_memory()),
                clock: clock.clone(),
                generator: generator.clone(),
            },
            policy,
        ));

        Self {
            service,
            storage,
            notifier,
            clock,
            generator,
            _temp: temp,
        }
    }

    pub async fn upload(&self, owner: AccountId, name: &str, bytes: &[u8]) -> FileResource {
        self.service
            .upload(owner, name, Box::new(std::io::Cursor::new(bytes.to_vec())))
            .await
            .expect("upload")
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage.root_path().to_path_buf()
    }
}

pub async fn read_all(mut reader: ContentReader) -> Vec<u8> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.expect("read content");
    buf
}
