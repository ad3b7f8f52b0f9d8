//! 账户目录：注册后的用户与口令校验，可选地以 JSON 形式持久化。

use anyhow::{Context, Result, anyhow};
use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::info;

use crate::atomic::write_atomic;
use crate::challenge::normalize_email;
use crate::models::AccountId;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewAccount {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>>;

    /// Returns `None` when the email is already registered.
    async fn create(&self, account: NewAccount) -> Result<Option<Account>>;

    async fn verify_credentials(&self, email: &str, password: &str) -> Result<Option<Account>>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredAccount {
    #[serde(flatten)]
    account: Account,
    password_hash: String,
}

/// 以规范化邮箱为键的账户表；文件所有权依赖账户 ID 跨重启保持不变。
pub struct IndexedAccountDirectory {
    accounts: Mutex<HashMap<String, StoredAccount>>,
    index_path: Option<PathBuf>,
}

impl IndexedAccountDirectory {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            index_path: None,
        }
    }

    /// 从账户文件加载；文件不存在时从空表开始。
    pub async fn open(index_path: PathBuf) -> Result<Self> {
        let mut accounts = HashMap::new();
        match tokio::fs::read(&index_path).await {
            Ok(bytes) => {
                let stored: Vec<StoredAccount> = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parse {}", index_path.display()))?;
                for entry in stored {
                    accounts.insert(normalize_email(&entry.account.email), entry);
                }
                info!(
                    path = %index_path.display(),
                    count = accounts.len(),
                    "loaded account index"
                );
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", index_path.display()));
            }
        }
        Ok(Self {
            accounts: Mutex::new(accounts),
            index_path: Some(index_path),
        })
    }

    async fn persist(&self, accounts: &HashMap<String, StoredAccount>) -> Result<()> {
        let Some(path) = &self.index_path else {
            return Ok(());
        };
        let stored: Vec<&StoredAccount> = accounts.values().collect();
        let bytes = serde_json::to_vec(&stored)?;
        write_atomic(path, &bytes)
            .await
            .with_context(|| format!("write {}", path.display()))
    }
}

#[async_trait]
impl AccountDirectory for IndexedAccountDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        let accounts = self.accounts.lock().await;
        Ok(accounts
            .get(&normalize_email(email))
            .map(|stored| stored.account.clone()))
    }

    async fn create(&self, account: NewAccount) -> Result<Option<Account>> {
        let email = normalize_email(&account.email);
        let password_hash = hash_password(account.password).await?;
        let mut accounts = self.accounts.lock().await;
        if accounts.contains_key(&email) {
            return Ok(None);
        }
        let created = Account {
            id: AccountId::new(),
            first_name: account.first_name,
            last_name: account.last_name,
            email: email.clone(),
            created_at: Utc::now(),
        };
        accounts.insert(
            email.clone(),
            StoredAccount {
                account: created.clone(),
                password_hash,
            },
        );
        if let Err(err) = self.persist(&accounts).await {
            accounts.remove(&email);
            return Err(err);
        }
        Ok(Some(created))
    }

    async fn verify_credentials(&self, email: &str, password: &str) -> Result<Option<Account>> {
        let (account, hash) = {
            let accounts = self.accounts.lock().await;
            match accounts.get(&normalize_email(email)) {
                Some(stored) => (stored.account.clone(), stored.password_hash.clone()),
                None => return Ok(None),
            }
        };
        let password = password.to_string();
        let valid = tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await??;
        Ok(valid.then_some(account))
    }
}

async fn hash_password(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| anyhow!("password hashing failed: {err}"))
    })
    .await?
}

fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|err| anyhow!("invalid password hash: {err}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn alice() -> NewAccount {
        NewAccount {
            first_name: "Alice".to_string(),
            last_name: "Liddell".to_string(),
            email: "Alice@Example.com".to_string(),
            password: "correct horse".to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_refused() {
        let directory = IndexedAccountDirectory::in_memory();
        assert!(directory.create(alice()).await.expect("create").is_some());
        assert!(directory.create(alice()).await.expect("create").is_none());
        assert!(
            directory
                .find_by_email("alice@example.com")
                .await
                .expect("find")
                .is_some()
        );
    }

    #[tokio::test]
    async fn credentials_are_checked_against_hash() {
        let directory = IndexedAccountDirectory::in_memory();
        let created = directory.create(alice()).await.expect("create").expect("new");

        let ok = directory
            .verify_credentials("alice@example.com", "correct horse")
            .await
            .expect("verify");
        assert_eq!(ok.map(|account| account.id), Some(created.id));

        let bad = directory
            .verify_credentials("alice@example.com", "battery staple")
            .await
            .expect("verify");
        assert!(bad.is_none());
    }

    #[tokio::test]
    async fn accounts_survive_reopen() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("accounts.json");
        let created = {
            let directory = IndexedAccountDirectory::open(path.clone()).await.expect("open");
            directory.create(alice()).await.expect("create").expect("new")
        };

        let reopened = IndexedAccountDirectory::open(path).await.expect("reopen");
        let found = reopened
            .verify_credentials("ALICE@example.com", "correct horse")
            .await
            .expect("verify");
        assert_eq!(found.map(|account| account.id), Some(created.id));
        assert!(reopened.create(alice()).await.expect("create").is_none());
    }
}
