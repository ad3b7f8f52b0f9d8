//! 访问控制服务：上传、按访问码下载、分享链接与所有者操作。
//!
//! A download by access code walks `NoChallenge → OtpIssued → OtpVerified →
//! Consumed`. Every step re-reads the stores, so a skipped or repeated step,
//! an expired challenge or a reaped file all end in a denial.

use chrono::Duration;
use serde::Serialize;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::challenge::{ChallengeKey, ChallengeStore, normalize_email};
use crate::clock::Clock;
use crate::codegen::CodeGenerator;
use crate::error::{AccessError, Subject};
use crate::links::{CreatedLink, LinkRequest, SharingLinkStore};
use crate::models::{AccessChannel, AccountId, DownloadRecord, FileResource, ResourceId};
use crate::notify::{Notifier, deliver_otp};
use crate::registry::{AccessCodeRegistry, ResourceDraft};
use crate::repository::ResourceRepository;
use crate::storage::{ContentReader, ContentStore};

#[derive(Clone, Debug)]
pub struct AccessPolicy {
    pub otp_ttl: Duration,
    pub resource_lifetime: Duration,
    pub access_code_length: usize,
    /// 0 disables the limit.
    pub max_upload_size: u64,
    /// MIME essences accepted on upload; empty accepts everything.
    pub allowed_types: Vec<String>,
}

/// 服务依赖的外部协作者。
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn ResourceRepository>,
    pub content: Arc<dyn ContentStore>,
    pub challenges: Arc<dyn ChallengeStore>,
    pub links: Arc<dyn SharingLinkStore>,
    pub notifier: Arc<dyn Notifier>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
    pub generator: Arc<dyn CodeGenerator>,
}

/// 已授权的下载：元数据加内容流。
pub struct Download {
    pub resource: FileResource,
    pub content: ContentReader,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnedPage {
    pub files: Vec<FileResource>,
    pub total: usize,
    pub page: usize,
    pub total_pages: usize,
}

pub const MAX_PAGE_SIZE: usize = 100;

pub struct AccessControlService {
    repository: Arc<dyn ResourceRepository>,
    content: Arc<dyn ContentStore>,
    challenges: Arc<dyn ChallengeStore>,
    links: Arc<dyn SharingLinkStore>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    registry: AccessCodeRegistry,
    policy: AccessPolicy,
}

impl AccessControlService {
    pub fn new(deps: Collaborators, policy: AccessPolicy) -> Self {
        let registry = AccessCodeRegistry::new(
            deps.repository.clone(),
            deps.generator.clone(),
            deps.clock.clone(),
            policy.access_code_length,
            policy.resource_lifetime,
        );
        Self {
            repository: deps.repository,
            content: deps.content,
            challenges: deps.challenges,
            links: deps.links,
            notifier: deps.notifier,
            audit: deps.audit,
            clock: deps.clock,
            registry,
            policy,
        }
    }

    /// 保存上传内容并分配访问码；分配失败时删除已写入的内容。
    pub async fn upload(
        &self,
        owner: AccountId,
        original_name: &str,
        body: ContentReader,
    ) -> Result<FileResource, AccessError> {
        let name = sanitize_file_name(original_name)?;
        self.check_type(&name)?;

        let limit = match self.policy.max_upload_size {
            0 => u64::MAX - 1,
            max => max,
        };
        let locator = Uuid::new_v4().simple().to_string();
        let size = self.content.write(&locator, body, limit).await?;
        if size > limit {
            return Err(AccessError::TooLarge(limit));
        }

        let draft = ResourceDraft {
            locator: locator.clone(),
            original_name: name,
            size,
            owner,
        };
        match self.registry.issue(draft).await {
            Ok(resource) => Ok(resource),
            Err(err) => {
                if let Err(cleanup) = self.content.delete(&locator).await {
                    warn!(locator, error = ?cleanup, "failed to remove content after rejected upload");
                }
                Err(err)
            }
        }
    }

    /// 所有者请求验证码：访问码必须属于调用者。
    pub async fn request_owner_otp(
        &self,
        caller: AccountId,
        email: &str,
        access_code: &str,
    ) -> Result<(), AccessError> {
        let email = require_email(email)?;
        let access_code = access_code.trim();
        let resource = self.live_by_code(access_code).await?;
        if resource.owner != caller {
            return Err(AccessError::Unauthorized);
        }
        let key = ChallengeKey::owner(&email, access_code);
        let secret = self.challenges.issue(key.clone(), self.policy.otp_ttl).await?;
        deliver_otp(self.notifier.as_ref(), key.flow(), &email, &secret, self.policy.otp_ttl).await
    }

    pub async fn verify_owner_otp(
        &self,
        email: &str,
        access_code: &str,
        otp: &str,
    ) -> Result<(), AccessError> {
        let email = require_email(email)?;
        let access_code = access_code.trim();
        self.challenges
            .verify(&ChallengeKey::owner(&email, access_code), otp)
            .await
    }

    /// 为按访问码下载签发验证码。
    pub async fn request_download_otp(&self, email: &str, access_code: &str) -> Result<(), AccessError> {
        let email = require_email(email)?;
        let access_code = access_code.trim();
        self.live_by_code(access_code).await?;
        let key = ChallengeKey::download(&email, access_code);
        let secret = self.challenges.issue(key.clone(), self.policy.otp_ttl).await?;
        info!(code = access_code, "download otp issued");
        deliver_otp(self.notifier.as_ref(), key.flow(), &email, &secret, self.policy.otp_ttl).await
    }

    pub async fn verify_download_otp(
        &self,
        email: &str,
        access_code: &str,
        otp: &str,
    ) -> Result<(), AccessError> {
        let email = require_email(email)?;
        let access_code = access_code.trim();
        self.challenges
            .verify(&ChallengeKey::download(&email, access_code), otp)
            .await
    }

    /// 消费已校验的挑战并返回内容；每次校验只能下载一次。
    pub async fn download(
        &self,
        caller: AccountId,
        email: &str,
        access_code: &str,
        origin: Option<IpAddr>,
    ) -> Result<Download, AccessError> {
        let email = require_email(email)?;
        let access_code = access_code.trim();
        let resource = self.live_by_code(access_code).await?;
        let content = self.open_content(&resource).await?;

        let key = ChallengeKey::download(&email, access_code);
        if !self.challenges.consume(&key).await? {
            return Err(AccessError::VerificationRequired);
        }

        self.audit
            .append(DownloadRecord {
                account: Some(caller),
                resource: resource.id,
                original_name: resource.original_name.clone(),
                downloaded_at: self.clock.now(),
                origin,
                email: Some(email),
                channel: AccessChannel::Code,
            })
            .await?;
        info!(id = %resource.id, code = access_code, "download granted");
        Ok(Download { resource, content })
    }

    /// 创建分享链接，仅限文件所有者。
    pub async fn create_share_link(
        &self,
        caller: AccountId,
        resource_id: ResourceId,
        ttl_minutes: u32,
        otp_required: bool,
    ) -> Result<CreatedLink, AccessError> {
        let resource = self
            .repository
            .find_by_id(resource_id)
            .await?
            .ok_or(AccessError::NotFound(Subject::File))?;
        if resource.owner != caller {
            return Err(AccessError::Unauthorized);
        }
        self.links
            .create(LinkRequest {
                resource: resource.id,
                ttl_minutes,
                otp_required,
                created_by: caller,
            })
            .await
    }

    /// Redeems a link without requiring an account. The target is looked up
    /// again, so a link that outlives its file resolves to "not found".
    pub async fn redeem_share_link(
        &self,
        link_id: &str,
        otp: Option<&str>,
        origin: Option<IpAddr>,
    ) -> Result<Download, AccessError> {
        let resource_id = self.links.redeem(link_id, otp).await?;
        let resource = self
            .repository
            .find_by_id(resource_id)
            .await?
            .ok_or(AccessError::NotFound(Subject::File))?;
        if resource.is_expired(self.clock.now()) {
            return Err(AccessError::Expired(Subject::File));
        }
        let content = self.open_content(&resource).await?;

        self.audit
            .append(DownloadRecord {
                account: None,
                resource: resource.id,
                original_name: resource.original_name.clone(),
                downloaded_at: self.clock.now(),
                origin,
                email: None,
                channel: AccessChannel::Link,
            })
            .await?;
        info!(id = %resource.id, link = link_id, "shared download granted");
        Ok(Download { resource, content })
    }

    /// 分页列出调用者的文件，最新的在前。
    pub async fn list_owned(
        &self,
        caller: AccountId,
        page: usize,
        limit: usize,
    ) -> Result<OwnedPage, AccessError> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let owned = self.repository.list_by_owner(caller).await?;
        let total = owned.len();
        let files = owned
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();
        Ok(OwnedPage {
            files,
            total,
            page,
            total_pages: total.div_ceil(limit),
        })
    }

    /// 所有者主动删除：先删内容再删元数据，内容删除失败只记录日志。
    pub async fn delete_resource(&self, caller: AccountId, id: ResourceId) -> Result<(), AccessError> {
        let resource = self
            .repository
            .find_by_id(id)
            .await?
            .ok_or(AccessError::NotFound(Subject::File))?;
        if resource.owner != caller {
            return Err(AccessError::Unauthorized);
        }
        if let Err(err) = self.content.delete(&resource.locator).await {
            warn!(id = %id, locator = resource.locator, error = ?err, "content left orphaned");
        }
        self.repository.delete(id).await?;
        info!(id = %id, "file deleted by owner");
        Ok(())
    }

    /// 所有者预览自己的文件，不需要验证码，也不计入下载历史。
    pub async fn preview_resource(&self, caller: AccountId, id: ResourceId) -> Result<Download, AccessError> {
        let resource = self
            .repository
            .find_by_id(id)
            .await?
            .ok_or(AccessError::NotFound(Subject::File))?;
        if resource.owner != caller {
            return Err(AccessError::Unauthorized);
        }
        if resource.is_expired(self.clock.now()) {
            return Err(AccessError::Expired(Subject::File));
        }
        let content = self.open_content(&resource).await?;
        Ok(Download { resource, content })
    }

    pub async fn download_history(&self, caller: AccountId) -> Result<Vec<DownloadRecord>, AccessError> {
        Ok(self.audit.for_account(caller).await?)
    }

    async fn live_by_code(&self, access_code: &str) -> Result<FileResource, AccessError> {
        let code = access_code.trim();
        if code.is_empty() {
            return Err(AccessError::invalid("access code is required"));
        }
        let resource = self
            .repository
            .find_by_access_code(code)
            .await?
            .ok_or(AccessError::NotFound(Subject::File))?;
        if resource.is_expired(self.clock.now()) {
            return Err(AccessError::Expired(Subject::File));
        }
        Ok(resource)
    }

    async fn open_content(&self, resource: &FileResource) -> Result<ContentReader, AccessError> {
        self.content
            .open(&resource.locator)
            .await?
            .ok_or(AccessError::NotFound(Subject::Content))
    }

    fn check_type(&self, name: &str) -> Result<(), AccessError> {
        if self.policy.allowed_types.is_empty() {
            return Ok(());
        }
        let mime = mime_guess::from_path(name).first_or_octet_stream();
        if self
            .policy
            .allowed_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime.essence_str()))
        {
            return Ok(());
        }
        Err(AccessError::invalid(format!(
            "file type {} not allowed",
            mime.essence_str()
        )))
    }
}

fn require_email(email: &str) -> Result<String, AccessError> {
    let email = normalize_email(email);
    if email.is_empty() || !email.contains('@') {
        return Err(AccessError::invalid("a valid email is required"));
    }
    Ok(email)
}

/// 只保留文件名部分，去掉客户端带来的目录。
fn sanitize_file_name(name: &str) -> Result<String, AccessError> {
    let trimmed = name.trim().replace('\\', "/");
    let base = Path::new(&trimmed)
        .file_name()
        .map(|value| value.to_string_lossy().trim().to_string())
        .unwrap_or_default();
    if base.is_empty() || base == "." || base == ".." {
        return Err(AccessError::invalid("file name is required"));
    }
    Ok(base)
}
