//! Out-of-band delivery of one-time passcodes.
//!
//! SMTP is used when a relay is configured; otherwise messages only go to the
//! log, which is enough for local development.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};

use crate::challenge::ChallengeFlow;
use crate::error::AccessError;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(settings: &SmtpSettings) -> Result<Self> {
        let from: Mailbox = settings
            .from
            .parse()
            .with_context(|| format!("invalid sender address {:?}", settings.from))?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
            .port(settings.port);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let recipient: Mailbox = to
            .parse()
            .with_context(|| format!("invalid recipient address {to:?}"))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;
        self.transport.send(message).await.context("smtp delivery")?;
        Ok(())
    }
}

/// 仅写日志的发送器。
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        info!(to, subject, body, "smtp not configured, message logged only");
        Ok(())
    }
}

/// 生成各流程验证码邮件的主题与正文。
pub fn otp_message(flow: ChallengeFlow, secret: &str, ttl_minutes: i64) -> (String, String) {
    let (subject, purpose) = match flow {
        ChallengeFlow::Registration => ("Your VaultDrop Registration OTP", "for registration"),
        ChallengeFlow::OwnerReauth => ("Your VaultDrop OTP Code", "to access the file"),
        ChallengeFlow::Download => ("Your VaultDrop Download OTP", "to download the file"),
    };
    let body = format!(
        "Your OTP code {purpose} is: {secret}. It expires in {ttl_minutes} minutes."
    );
    (subject.to_string(), body)
}

/// Mails a freshly issued passcode. A delivery failure leaves the challenge in
/// place; the caller sees an upstream error and may request a new one.
pub async fn deliver_otp(
    notifier: &dyn Notifier,
    flow: ChallengeFlow,
    to: &str,
    secret: &str,
    ttl: chrono::Duration,
) -> std::result::Result<(), AccessError> {
    let (subject, body) = otp_message(flow, secret, ttl.num_minutes());
    notifier.send(to, &subject, &body).await.map_err(|err| {
        warn!(to, ?flow, error = ?err, "otp delivery failed");
        AccessError::Upstream(err)
    })
}
