//! 访问码分配：生成候选码并借助仓库的原子插入保证唯一。

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::codegen::CodeGenerator;
use crate::error::AccessError;
use crate::models::{AccountId, FileResource, ResourceId};
use crate::repository::{InsertOutcome, ResourceRepository};

pub const MAX_CODE_ATTEMPTS: u32 = 20;

/// 待登记的上传结果。
#[derive(Clone, Debug)]
pub struct ResourceDraft {
    pub locator: String,
    pub original_name: String,
    pub size: u64,
    pub owner: AccountId,
}

pub struct AccessCodeRegistry {
    repository: Arc<dyn ResourceRepository>,
    generator: Arc<dyn CodeGenerator>,
    clock: Arc<dyn Clock>,
    code_length: usize,
    lifetime: Duration,
}

impl AccessCodeRegistry {
    pub fn new(
        repository: Arc<dyn ResourceRepository>,
        generator: Arc<dyn CodeGenerator>,
        clock: Arc<dyn Clock>,
        code_length: usize,
        lifetime: Duration,
    ) -> Self {
        Self {
            repository,
            generator,
            clock,
            code_length,
            lifetime,
        }
    }

    /// 为草稿分配唯一访问码并持久化。
    pub async fn issue(&self, draft: ResourceDraft) -> Result<FileResource, AccessError> {
        if self.lifetime <= Duration::zero() {
            return Err(AccessError::invalid("resource lifetime must be positive"));
        }
        let created_at = self.clock.now();
        let id = ResourceId::new();

        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let access_code = self.generator.access_code(self.code_length);
            if self.repository.exists_with_access_code(&access_code).await? {
                debug!(attempt, "access code already held");
                continue;
            }
            let resource = FileResource {
                id,
                locator: draft.locator.clone(),
                original_name: draft.original_name.clone(),
                size: draft.size,
                access_code,
                created_at,
                expires_at: created_at + self.lifetime,
                owner: draft.owner,
            };
            match self.repository.try_insert(resource.clone()).await? {
                InsertOutcome::Inserted => {
                    info!(id = %resource.id, code = %resource.access_code, "issued access code");
                    return Ok(resource);
                }
                InsertOutcome::CodeTaken => {
                    debug!(attempt, "access code collision");
                }
            }
        }

        Err(AccessError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codegen::ScriptedGenerator;
    use crate::repository::IndexedRepository;

    fn draft(owner: AccountId) -> ResourceDraft {
        ResourceDraft {
            locator: "blob".to_string(),
            original_name: "notes.txt".to_string(),
            size: 12,
            owner,
        }
    }

    fn make_registry(
        generator: Arc<ScriptedGenerator>,
        code_length: usize,
    ) -> (Arc<IndexedRepository>, AccessCodeRegistry) {
        let repo = Arc::new(IndexedRepository::in_memory());
        let registry = AccessCodeRegistry::new(
            repo.clone(),
            generator,
            Arc::new(ManualClock::starting_at_epoch()),
            code_length,
            Duration::hours(24),
        );
        (repo, registry)
    }

    #[tokio::test]
    async fn collision_retries_with_fresh_code() {
        let generator = Arc::new(ScriptedGenerator::new(["AB12CD", "AB12CD", "XY34ZW"]));
        let (_repo, registry) = make_registry(generator, 6);
        let owner = AccountId::new();

        let first = registry.issue(draft(owner)).await.expect("first");
        let second = registry.issue(draft(owner)).await.expect("second");

        assert_eq!(first.access_code, "AB12CD");
        assert_eq!(second.access_code, "XY34ZW");
    }

    #[tokio::test]
    async fn issued_codes_never_collide_with_live_resources() {
        for length in [1usize, 2, 4, 6] {
            let generator = Arc::new(ScriptedGenerator::default());
            let (repo, registry) = make_registry(generator.clone(), length);
            let owner = AccountId::new();
            let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
            for _ in 0..5 {
                if let Some(code) = seen.iter().next().cloned() {
                    // force a duplicate ahead of the random fallback
                    generator.push(&code);
                }
                match registry.issue(draft(owner)).await {
                    Ok(resource) => {
                        assert!(seen.insert(resource.access_code.clone()));
                        let stored = repo
                            .find_by_access_code(&resource.access_code)
                            .await
                            .expect("find");
                        assert_eq!(stored.map(|r| r.id), Some(resource.id));
                    }
                    Err(AccessError::CodeSpaceExhausted(_)) => assert_eq!(length, 1),
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn exhausted_space_is_reported() {
        let tokens = std::iter::repeat_n("SAME00", MAX_CODE_ATTEMPTS as usize + 1);
        let generator = Arc::new(ScriptedGenerator::new(tokens));
        let (_repo, registry) = make_registry(generator, 6);
        let owner = AccountId::new();

        registry.issue(draft(owner)).await.expect("first");
        let result = registry.issue(draft(owner)).await;
        assert!(matches!(
            result,
            Err(AccessError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
        ));
    }

    #[tokio::test]
    async fn expiry_is_after_creation() {
        let generator = Arc::new(ScriptedGenerator::default());
        let (_repo, registry) = make_registry(generator, 6);
        let resource = registry.issue(draft(AccountId::new())).await.expect("issue");
        assert_eq!(resource.expires_at - resource.created_at, Duration::hours(24));
    }
}
