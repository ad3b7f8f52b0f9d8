//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const CONTENT_DIR: &str = "files";
pub const FILE_INDEX_NAME: &str = "files.json";
pub const AUDIT_LOG_NAME: &str = "downloads.jsonl";
pub const ACCOUNT_INDEX_NAME: &str = "accounts.json";
pub const AUTH_COOKIE_NAME: &str = "VAULTDROP_SESSION";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_OTP_TTL_SECS: u64 = 5 * 60;
pub const DEFAULT_OTP_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_FILE_TTL_SECS: u64 = 24 * 60 * 60;
pub const MAX_OTP_TTL_SECS: u64 = 24 * 60 * 60;
pub const MAX_FILE_TTL_SECS: u64 = 366 * 24 * 60 * 60;
pub const DEFAULT_ACCESS_CODE_LENGTH: usize = 6;
pub const DEFAULT_LINK_ID_LENGTH: usize = 8;
pub const DEFAULT_LINK_TTL_MINUTES: u32 = 60;
pub const MAX_LINK_TTL_MINUTES: u32 = 24 * 60;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 20 * 1024 * 1024;
pub const DEFAULT_ALLOWED_TYPES: &str = "application/pdf,image/png,image/jpeg,text/plain,\
application/zip,application/msword,application/vnd.ms-excel,\
application/vnd.openxmlformats-officedocument.wordprocessingml.document,\
application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const DEFAULT_LIST_LIMIT: usize = 10;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 300;
pub const CHALLENGE_PRUNE_INTERVAL_SECS: u64 = 60;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "vaultdrop", version = VERSION_INFO, about = "VaultDrop server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "VAULTDROP_STORAGE_DIR",
        default_value = ".vaultdrop",
        help = "Directory for file content, the file index and the download log"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "VAULTDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "VAULTDROP_HTTP_PORT",
        default_value_t = 5000,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "VAULTDROP_HTTPS_PORT",
        default_value_t = 5443,
        help = "HTTPS port, used only when a certificate and key are given"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "VAULTDROP_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "VAULTDROP_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "VAULTDROP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "VAULTDROP_LOG_LEVEL",
        default_value = "info",
        help = "Default log filter when RUST_LOG is unset"
    )]
    pub log_level: String,
    #[arg(
        long,
        env = "VAULTDROP_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Session expiration in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "VAULTDROP_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max login attempts before lockout (0 to disable)"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "VAULTDROP_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Login attempt window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "VAULTDROP_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Login lockout time after max attempts"
    )]
    pub login_lockout_secs: u64,
    #[arg(
        long,
        env = "VAULTDROP_OTP_TTL_SECS",
        default_value_t = DEFAULT_OTP_TTL_SECS,
        help = "Validity window of one-time passcodes in seconds"
    )]
    pub otp_ttl_secs: u64,
    #[arg(
        long,
        env = "VAULTDROP_OTP_MAX_ATTEMPTS",
        default_value_t = DEFAULT_OTP_MAX_ATTEMPTS,
        help = "Wrong guesses before a passcode is dropped (0 to disable)"
    )]
    pub otp_max_attempts: u32,
    #[arg(
        long,
        env = "VAULTDROP_FILE_TTL_SECS",
        default_value_t = DEFAULT_FILE_TTL_SECS,
        help = "Lifetime of uploaded files in seconds"
    )]
    pub file_ttl_secs: u64,
    #[arg(
        long,
        env = "VAULTDROP_ACCESS_CODE_LENGTH",
        default_value_t = DEFAULT_ACCESS_CODE_LENGTH,
        help = "Length of generated access codes"
    )]
    pub access_code_length: usize,
    #[arg(
        long,
        env = "VAULTDROP_LINK_ID_LENGTH",
        default_value_t = DEFAULT_LINK_ID_LENGTH,
        help = "Length of generated sharing link ids"
    )]
    pub link_id_length: usize,
    #[arg(
        long,
        env = "VAULTDROP_LINK_MAX_TTL_MINUTES",
        default_value_t = MAX_LINK_TTL_MINUTES,
        help = "Longest lifetime a sharing link may request, in minutes"
    )]
    pub link_max_ttl_minutes: u32,
    #[arg(
        long,
        env = "VAULTDROP_REAPER_INTERVAL_SECS",
        default_value_t = DEFAULT_REAPER_INTERVAL_SECS,
        help = "Seconds between expired file sweeps"
    )]
    pub reaper_interval_secs: u64,
    #[arg(
        long,
        env = "VAULTDROP_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "VAULTDROP_ALLOWED_TYPES",
        default_value = DEFAULT_ALLOWED_TYPES,
        help = "Comma separated MIME types accepted on upload (empty accepts all)"
    )]
    pub allowed_types: String,
    #[arg(long, env = "VAULTDROP_SMTP_HOST", help = "SMTP relay host; OTP mail is only logged when unset")]
    pub smtp_host: Option<String>,
    #[arg(long, env = "VAULTDROP_SMTP_PORT", default_value_t = 25, help = "SMTP relay port")]
    pub smtp_port: u16,
    #[arg(long, env = "VAULTDROP_SMTP_USER", help = "SMTP username")]
    pub smtp_user: Option<String>,
    #[arg(long, env = "VAULTDROP_SMTP_PASS", help = "SMTP password")]
    pub smtp_pass: Option<String>,
    #[arg(
        long,
        env = "VAULTDROP_MAIL_FROM",
        default_value = "VaultDrop <noreply@localhost>",
        help = "Sender address for OTP mail"
    )]
    pub mail_from: String,
}

impl Args {
    /// 校验启动参数。
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_OTP_TTL_SECS).contains(&self.otp_ttl_secs) {
            return Err(format!("otp ttl must be between 1 and {MAX_OTP_TTL_SECS} seconds"));
        }
        if !(1..=MAX_FILE_TTL_SECS).contains(&self.file_ttl_secs) {
            return Err(format!("file ttl must be between 1 and {MAX_FILE_TTL_SECS} seconds"));
        }
        if !(4..=16).contains(&self.access_code_length) {
            return Err("access code length must be between 4 and 16".into());
        }
        if !(6..=32).contains(&self.link_id_length) {
            return Err("link id length must be between 6 and 32".into());
        }
        if self.link_max_ttl_minutes == 0 {
            return Err("link max ttl must be positive".into());
        }
        if self.reaper_interval_secs == 0 {
            return Err("reaper interval must be positive".into());
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err("tls cert and key must be given together".into());
        }
        Ok(())
    }

    /// 仅在 `validate` 通过后调用。
    pub fn otp_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.otp_ttl_secs.min(MAX_OTP_TTL_SECS) as i64)
    }

    pub fn file_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.file_ttl_secs.min(MAX_FILE_TTL_SECS) as i64)
    }

    pub fn allowed_types(&self) -> Vec<String> {
        self.allowed_types
            .split(',')
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let args = Args::parse_from(["vaultdrop"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.otp_ttl_secs, 300);
        assert!(args.allowed_types().contains(&"application/pdf".to_string()));
    }

    #[test]
    fn half_configured_tls_is_rejected() {
        let args = Args::parse_from(["vaultdrop", "--tls-cert", "cert.pem"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn oversized_lifetimes_are_rejected() {
        let args = Args::parse_from(["vaultdrop", "--file-ttl-secs", "18446744073709551615"]);
        assert!(args.validate().is_err());
        assert!(args.file_ttl() > chrono::Duration::zero());

        let args = Args::parse_from(["vaultdrop", "--otp-ttl-secs", "86401"]);
        assert!(args.validate().is_err());

        let args = Args::parse_from(["vaultdrop", "--file-ttl-secs", "31536000"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.file_ttl(), chrono::Duration::days(365));
    }

    #[test]
    fn empty_type_list_accepts_everything() {
        let args = Args::parse_from(["vaultdrop", "--allowed-types", ""]);
        assert!(args.allowed_types().is_empty());
    }
}
