//! 注册与登录：注册前必须通过邮箱验证码。

use chrono::Duration;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::accounts::{Account, AccountDirectory, NewAccount};
use crate::challenge::{ChallengeKey, ChallengeStore, normalize_email};
use crate::error::AccessError;
use crate::notify::{Notifier, deliver_otp};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub otp: String,
}

pub struct RegistrationService {
    accounts: Arc<dyn AccountDirectory>,
    challenges: Arc<dyn ChallengeStore>,
    notifier: Arc<dyn Notifier>,
    otp_ttl: Duration,
}

impl RegistrationService {
    pub fn new(
        accounts: Arc<dyn AccountDirectory>,
        challenges: Arc<dyn ChallengeStore>,
        notifier: Arc<dyn Notifier>,
        otp_ttl: Duration,
    ) -> Self {
        Self {
            accounts,
            challenges,
            notifier,
            otp_ttl,
        }
    }

    /// 向尚未注册的邮箱发送验证码。
    pub async fn request_otp(&self, email: &str) -> Result<(), AccessError> {
        let email = normalize_email(email);
        if email.is_empty() || !email.contains('@') {
            return Err(AccessError::invalid("a valid email is required"));
        }
        if self.accounts.find_by_email(&email).await?.is_some() {
            return Err(AccessError::AccountExists);
        }
        let key = ChallengeKey::registration(&email);
        let secret = self.challenges.issue(key.clone(), self.otp_ttl).await?;
        deliver_otp(self.notifier.as_ref(), key.flow(), &email, &secret, self.otp_ttl).await
    }

    /// Verifies the passcode, claims it, then creates the account. A claimed
    /// passcode is gone even if account creation loses a race on the email.
    pub async fn register(&self, request: RegistrationRequest) -> Result<Account, AccessError> {
        let email = normalize_email(&request.email);
        let fields = [
            request.first_name.trim(),
            request.last_name.trim(),
            email.as_str(),
            request.password.as_str(),
            request.otp.trim(),
        ];
        if fields.iter().any(|field| field.is_empty()) {
            return Err(AccessError::invalid("all fields are required"));
        }

        let key = ChallengeKey::registration(&email);
        self.challenges.verify(&key, &request.otp).await?;
        if self.accounts.find_by_email(&email).await?.is_some() {
            return Err(AccessError::AccountExists);
        }
        if !self.challenges.consume(&key).await? {
            return Err(AccessError::VerificationRequired);
        }

        let account = self
            .accounts
            .create(NewAccount {
                first_name: request.first_name.trim().to_string(),
                last_name: request.last_name.trim().to_string(),
                email,
                password: request.password,
            })
            .await?
            .ok_or(AccessError::AccountExists)?;
        info!(account = %account.id, "account registered");
        Ok(account)
    }

    pub async fn authenticate(&self, email: &str, password: &str) -> Result<Account, AccessError> {
        self.accounts
            .verify_credentials(email, password)
            .await?
            .ok_or(AccessError::InvalidCredentials)
    }
}
