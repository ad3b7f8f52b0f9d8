//! 分享链接存储：与账户解耦的临时授权。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::challenge::secrets_match;
use crate::clock::Clock;
use crate::codegen::CodeGenerator;
use crate::error::{AccessError, Subject};
use crate::models::{AccountId, ResourceId};

/// 链接自带的一次性验证码。
#[derive(Clone, Debug)]
pub struct EmbeddedOtp {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub failed_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct SharingLink {
    pub id: String,
    pub resource: ResourceId,
    pub created_by: AccountId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub otp: Option<EmbeddedOtp>,
}

impl SharingLink {
    /// 零分钟的链接创建即过期。
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at || self.expires_at <= self.created_at
    }
}

/// 创建结果；`otp` 只在此处以明文出现一次。
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedLink {
    pub link_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LinkRequest {
    pub resource: ResourceId,
    pub ttl_minutes: u32,
    pub otp_required: bool,
    pub created_by: AccountId,
}

#[async_trait]
pub trait SharingLinkStore: Send + Sync {
    async fn create(&self, request: LinkRequest) -> Result<CreatedLink, AccessError>;

    /// Resolves a link to its target. The link itself stays redeemable until
    /// it expires; an embedded OTP is spent by the first successful use.
    async fn redeem(&self, link_id: &str, otp: Option<&str>) -> Result<ResourceId, AccessError>;

    async fn purge_expired(&self) -> Result<usize, AccessError>;
}

#[derive(Clone, Copy, Debug)]
pub struct LinkPolicy {
    pub id_length: usize,
    pub max_ttl_minutes: u32,
    pub otp_ttl: Duration,
    /// 0 表示不限制验证码错误次数。
    pub max_attempts: u32,
}

pub struct MemoryLinkStore {
    links: Mutex<HashMap<String, SharingLink>>,
    clock: Arc<dyn Clock>,
    generator: Arc<dyn CodeGenerator>,
    policy: LinkPolicy,
}

impl MemoryLinkStore {
    pub fn new(clock: Arc<dyn Clock>, generator: Arc<dyn CodeGenerator>, policy: LinkPolicy) -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
            clock,
            generator,
            policy,
        }
    }
}

#[async_trait]
impl SharingLinkStore for MemoryLinkStore {
    async fn create(&self, request: LinkRequest) -> Result<CreatedLink, AccessError> {
        if request.ttl_minutes > self.policy.max_ttl_minutes {
            return Err(AccessError::invalid(format!(
                "link lifetime must be at most {} minutes",
                self.policy.max_ttl_minutes
            )));
        }
        let now = self.clock.now();
        let expires_at = now + Duration::minutes(i64::from(request.ttl_minutes));
        let otp = request.otp_required.then(|| EmbeddedOtp {
            secret: self.generator.otp_secret(),
            expires_at: now + self.policy.otp_ttl,
            used: false,
            failed_attempts: 0,
        });
        let plain_otp = otp.as_ref().map(|otp| otp.secret.clone());

        let mut links = self.links.lock().await;
        let link_id = loop {
            let candidate = self.generator.link_id(self.policy.id_length);
            if !links.contains_key(&candidate) {
                break candidate;
            }
            debug!("link id collision");
        };
        links.insert(
            link_id.clone(),
            SharingLink {
                id: link_id.clone(),
                resource: request.resource,
                created_by: request.created_by,
                created_at: now,
                expires_at,
                otp,
            },
        );
        info!(
            link = %link_id,
            resource = %request.resource,
            otp_required = request.otp_required,
            "created sharing link"
        );

        Ok(CreatedLink {
            link_id,
            expires_at,
            otp: plain_otp,
        })
    }

    async fn redeem(&self, link_id: &str, otp: Option<&str>) -> Result<ResourceId, AccessError> {
        let now = self.clock.now();
        let mut links = self.links.lock().await;
        let link = links
            .get_mut(link_id)
            .ok_or(AccessError::NotFound(Subject::Link))?;
        if link.is_expired(now) {
            return Err(AccessError::Expired(Subject::Link));
        }
        if let Some(embedded) = link.otp.as_mut() {
            let candidate = otp
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or(AccessError::OtpRequired)?;
            if now > embedded.expires_at {
                return Err(AccessError::Expired(Subject::Passcode));
            }
            if embedded.used {
                return Err(AccessError::AlreadyConsumed);
            }
            if !secrets_match(&embedded.secret, candidate) {
                embedded.failed_attempts = embedded.failed_attempts.saturating_add(1);
                let max_attempts = self.policy.max_attempts;
                if max_attempts > 0 && embedded.failed_attempts >= max_attempts {
                    links.remove(link_id);
                    warn!(link = link_id, "sharing link revoked after repeated otp mismatches");
                    return Err(AccessError::AttemptsExceeded);
                }
                return Err(AccessError::Mismatch);
            }
            embedded.used = true;
        }
        Ok(link.resource)
    }

    async fn purge_expired(&self) -> Result<usize, AccessError> {
        let now = self.clock.now();
        let mut links = self.links.lock().await;
        let before = links.len();
        links.retain(|_, link| !link.is_expired(now));
        Ok(before - links.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codegen::ScriptedGenerator;

    fn policy() -> LinkPolicy {
        LinkPolicy {
            id_length: 8,
            max_ttl_minutes: 1440,
            otp_ttl: Duration::minutes(5),
            max_attempts: 3,
        }
    }

    fn make_store() -> (Arc<ManualClock>, Arc<ScriptedGenerator>, MemoryLinkStore) {
        let clock = Arc::new(ManualClock::starting_at_epoch());
        let generator = Arc::new(ScriptedGenerator::default());
        let store = MemoryLinkStore::new(clock.clone(), generator.clone(), policy());
        (clock, generator, store)
    }

    fn request(ttl_minutes: u32, otp_required: bool) -> LinkRequest {
        LinkRequest {
            resource: ResourceId::new(),
            ttl_minutes,
            otp_required,
            created_by: AccountId::new(),
        }
    }

    #[tokio::test]
    async fn open_link_redeems_repeatedly() {
        let (_clock, _generator, store) = make_store();
        let req = request(60, false);
        let target = req.resource;
        let created = store.create(req).await.expect("create");
        assert_eq!(created.link_id.len(), 8);
        assert!(created.otp.is_none());

        for _ in 0..3 {
            assert_eq!(store.redeem(&created.link_id, None).await.expect("redeem"), target);
        }
    }

    #[tokio::test]
    async fn unknown_link_is_not_found() {
        let (_clock, _generator, store) = make_store();
        let result = store.redeem("nope1234", None).await;
        assert!(matches!(result, Err(AccessError::NotFound(Subject::Link))));
    }

    #[tokio::test]
    async fn zero_ttl_link_expires_immediately() {
        let (clock, _generator, store) = make_store();
        let created = store.create(request(0, false)).await.expect("create");
        let result = store.redeem(&created.link_id, None).await;
        assert!(matches!(result, Err(AccessError::Expired(Subject::Link))));

        clock.advance(Duration::seconds(1));
        let result = store.redeem(&created.link_id, None).await;
        assert!(matches!(result, Err(AccessError::Expired(Subject::Link))));
    }

    #[tokio::test]
    async fn ttl_above_maximum_is_rejected() {
        let (_clock, _generator, store) = make_store();
        let result = store.create(request(1441, false)).await;
        assert!(matches!(result, Err(AccessError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn otp_gate_checks_in_order() {
        let (clock, generator, store) = make_store();
        generator.push("abcDEF12");
        generator.push("314159");
        let created = store.create(request(60, true)).await.expect("create");
        assert_eq!(created.link_id, "abcDEF12");
        assert_eq!(created.otp.as_deref(), Some("314159"));

        assert!(matches!(
            store.redeem("abcDEF12", None).await,
            Err(AccessError::OtpRequired)
        ));
        assert!(matches!(
            store.redeem("abcDEF12", Some("000000")).await,
            Err(AccessError::Mismatch)
        ));

        clock.advance(Duration::minutes(6));
        assert!(matches!(
            store.redeem("abcDEF12", Some("314159")).await,
            Err(AccessError::Expired(Subject::Passcode))
        ));
    }

    #[tokio::test]
    async fn embedded_otp_is_single_use() {
        let (_clock, generator, store) = make_store();
        generator.push("LINKID01");
        generator.push("271828");
        store.create(request(60, true)).await.expect("create");

        store.redeem("LINKID01", Some("271828")).await.expect("first redeem");
        let second = store.redeem("LINKID01", Some("271828")).await;
        assert!(matches!(second, Err(AccessError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn colliding_link_id_is_regenerated() {
        let (_clock, generator, store) = make_store();
        generator.push("DUPLIC01");
        generator.push("DUPLIC01");
        generator.push("FRESH001");
        store.create(request(60, false)).await.expect("first");
        let second = store.create(request(60, false)).await.expect("second");
        assert_eq!(second.link_id, "FRESH001");
    }

    #[tokio::test]
    async fn purge_drops_expired_links() {
        let (clock, _generator, store) = make_store();
        let short = store.create(request(1, false)).await.expect("short");
        let long = store.create(request(120, false)).await.expect("long");
        clock.advance(Duration::minutes(2));

        assert_eq!(store.purge_expired().await.expect("purge"), 1);
        assert!(matches!(
            store.redeem(&short.link_id, None).await,
            Err(AccessError::NotFound(_))
        ));
        assert!(store.redeem(&long.link_id, None).await.is_ok());
    }

    #[tokio::test]
    async fn repeated_otp_mismatches_revoke_link() {
        let (_clock, generator, store) = make_store();
        generator.push("GUESSME1");
        generator.push("161803");
        store.create(request(60, true)).await.expect("create");

        for _ in 0..2 {
            assert!(matches!(
                store.redeem("GUESSME1", Some("000000")).await,
                Err(AccessError::Mismatch)
            ));
        }
        assert!(matches!(
            store.redeem("GUESSME1", Some("000001")).await,
            Err(AccessError::AttemptsExceeded)
        ));
        assert!(matches!(
            store.redeem("GUESSME1", Some("161803")).await,
            Err(AccessError::NotFound(Subject::Link))
        ));
    }
}
