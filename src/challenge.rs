//! 一次性验证码（OTP）挑战存储。
//!
//! Registration, owner re-authentication and gated downloads share one store;
//! the flow kind is part of every key, so the three namespaces never collide
//! even when their subjects look alike.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::codegen::CodeGenerator;
use crate::error::{AccessError, Subject};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChallengeFlow {
    Registration,
    OwnerReauth,
    Download,
}

impl ChallengeFlow {
    /// 是否需要在校验之后再单独消费。
    pub fn requires_consumption(self) -> bool {
        !matches!(self, ChallengeFlow::OwnerReauth)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChallengeKey {
    flow: ChallengeFlow,
    subject: String,
    resource: Option<String>,
}

impl ChallengeKey {
    pub fn registration(email: &str) -> Self {
        Self {
            flow: ChallengeFlow::Registration,
            subject: normalize_email(email),
            resource: None,
        }
    }

    pub fn owner(email: &str, access_code: &str) -> Self {
        Self {
            flow: ChallengeFlow::OwnerReauth,
            subject: normalize_email(email),
            resource: Some(access_code.to_string()),
        }
    }

    pub fn download(email: &str, access_code: &str) -> Self {
        Self {
            flow: ChallengeFlow::Download,
            subject: normalize_email(email),
            resource: Some(access_code.to_string()),
        }
    }

    pub fn flow(&self) -> ChallengeFlow {
        self.flow
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[derive(Clone, Debug)]
pub struct OtpChallenge {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
    pub verified: bool,
    pub failed_attempts: u32,
}

/// OTP 挑战存储。单个 key 上的所有操作都是线性化的。
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// 创建或覆盖挑战，返回需要通过邮件发送的明文验证码。
    async fn issue(&self, key: ChallengeKey, ttl: Duration) -> Result<String, AccessError>;

    /// Checks `candidate` against the live challenge for `key`.
    async fn verify(&self, key: &ChallengeKey, candidate: &str) -> Result<(), AccessError>;

    /// 原子地检查已校验状态并删除；并发调用只有一个返回 `true`。
    async fn consume(&self, key: &ChallengeKey) -> Result<bool, AccessError>;

    /// 清理过期挑战，返回清理数量。
    async fn purge_expired(&self) -> Result<usize, AccessError>;
}

pub struct MemoryChallengeStore {
    entries: Mutex<HashMap<ChallengeKey, OtpChallenge>>,
    clock: Arc<dyn Clock>,
    generator: Arc<dyn CodeGenerator>,
    max_attempts: u32,
}

impl MemoryChallengeStore {
    /// `max_attempts` of 0 disables the failed-attempt limit.
    pub fn new(clock: Arc<dyn Clock>, generator: Arc<dyn CodeGenerator>, max_attempts: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            generator,
            max_attempts,
        }
    }
}

#[async_trait]
impl ChallengeStore for MemoryChallengeStore {
    async fn issue(&self, key: ChallengeKey, ttl: Duration) -> Result<String, AccessError> {
        let secret = self.generator.otp_secret();
        let challenge = OtpChallenge {
            secret: secret.clone(),
            expires_at: self.clock.now() + ttl,
            verified: false,
            failed_attempts: 0,
        };
        let mut entries = self.entries.lock().await;
        if entries.insert(key.clone(), challenge).is_some() {
            debug!(flow = ?key.flow, "replaced pending challenge");
        }
        Ok(secret)
    }

    async fn verify(&self, key: &ChallengeKey, candidate: &str) -> Result<(), AccessError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(key) else {
            return Err(AccessError::NotFound(Subject::Passcode));
        };

        if now > entry.expires_at {
            entries.remove(key);
            return Err(AccessError::Expired(Subject::Passcode));
        }
        if entry.verified {
            return Err(AccessError::AlreadyConsumed);
        }
        if !secrets_match(&entry.secret, candidate) {
            entry.failed_attempts = entry.failed_attempts.saturating_add(1);
            if self.max_attempts > 0 && entry.failed_attempts >= self.max_attempts {
                entries.remove(key);
                warn!(flow = ?key.flow, "challenge dropped after repeated mismatches");
                return Err(AccessError::AttemptsExceeded);
            }
            return Err(AccessError::Mismatch);
        }

        if key.flow.requires_consumption() {
            entry.verified = true;
        } else {
            entries.remove(key);
        }
        Ok(())
    }

    async fn consume(&self, key: &ChallengeKey) -> Result<bool, AccessError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let state = entries
            .get(key)
            .map(|entry| (entry.verified, now > entry.expires_at));
        match state {
            Some((_, true)) => {
                entries.remove(key);
                Ok(false)
            }
            Some((true, false)) => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired(&self) -> Result<usize, AccessError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at >= now);
        Ok(before - entries.len())
    }
}

pub(crate) fn secrets_match(expected: &str, candidate: &str) -> bool {
    let expected = expected.as_bytes();
    let candidate = candidate.trim().as_bytes();
    if expected.len() != candidate.len() {
        return false;
    }
    expected
        .iter()
        .zip(candidate)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
