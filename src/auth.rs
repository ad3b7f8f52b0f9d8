//! 认证处理、注册接口、会话管理与登录限流。

use axum::extract::{Extension, Json, connect_info::ConnectInfo};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::{body::Body as AxumBody, middleware, response::IntoResponse};
use axum_extra::extract::{CookieJar, TypedHeader, cookie::Cookie};
use axum_extra::headers::{Authorization, authorization::Bearer};
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::accounts::Account;
use crate::config::AUTH_COOKIE_NAME;
use crate::error::{AccessError, ApiError};
use crate::http::{RequestScheme, is_https_request, resolve_client_ip};
use crate::models::AccountId;
use crate::registration::{RegistrationRequest, RegistrationService};

#[derive(Debug)]
pub struct AuthConfig {
    pub sessions: Mutex<HashMap<String, SessionEntry>>,
    pub session_ttl: Duration,
    pub login_attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    pub login_window: Duration,
    pub login_max_attempts: u32,
    pub login_lockout: Duration,
}

impl AuthConfig {
    pub fn new(
        session_ttl: Duration,
        login_window: Duration,
        login_max_attempts: u32,
        login_lockout: Duration,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            session_ttl,
            login_attempts: Mutex::new(HashMap::new()),
            login_window,
            login_max_attempts,
            login_lockout,
        }
    }
}

#[derive(Debug)]
pub struct SessionEntry {
    pub account: AccountId,
    pub email: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct LoginAttempt {
    pub window_start: Instant,
    pub failures: u32,
    pub locked_until: Option<Instant>,
}

/// 已登录用户，由中间件写入请求扩展。
#[derive(Clone, Debug)]
pub struct CurrentUser {
    pub id: AccountId,
    pub email: String,
}

/// 认证中间件：校验 Cookie 或 Bearer 会话令牌。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    if is_auth_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    if let Some(token) = request_token(&jar, bearer.as_ref())
        && let Some(user) = session_user(&auth, &token).await
    {
        req.extensions_mut().insert(user);
        return Ok(next.run(req).await);
    }

    Err(ApiError::Unauthorized("authentication required".into()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthLoginRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthLoginResponse {
    token: String,
    user: Account,
}

/// 登录接口：创建会话并写入 Cookie，同时返回令牌供 API 客户端使用。
pub async fn auth_login(
    Extension(auth): Extension<Arc<AuthConfig>>,
    Extension(registration): Extension<Arc<RegistrationService>>,
    Extension(scheme): Extension<RequestScheme>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<AuthLoginRequest>,
) -> Result<(CookieJar, Json<AuthLoginResponse>), ApiError> {
    let client_ip = resolve_client_ip(&headers, Some(addr.ip())).unwrap_or_else(|| addr.ip());

    if let Some(retry_after) = check_login_rate_limit(&auth, client_ip).await {
        return Err(ApiError::TooManyRequests(retry_after));
    }

    let account = match registration
        .authenticate(&payload.email, &payload.password)
        .await
    {
        Ok(account) => account,
        Err(AccessError::InvalidCredentials) => {
            register_login_failure(&auth, client_ip).await;
            return Err(AccessError::InvalidCredentials.into());
        }
        Err(err) => return Err(err.into()),
    };

    clear_login_failures(&auth, client_ip).await;

    let token = Uuid::new_v4().to_string();
    let expires_at = Instant::now() + auth.session_ttl;
    {
        let mut sessions = auth.sessions.lock().await;
        sessions.insert(
            token.clone(),
            SessionEntry {
                account: account.id,
                email: account.email.clone(),
                expires_at,
            },
        );
    }
    info!(account = %account.id, client_ip = %client_ip, "login succeeded");

    let secure = is_https_request(&headers, scheme);
    let cookie = Cookie::build((AUTH_COOKIE_NAME, token.clone()))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(axum_extra::extract::cookie::SameSite::Strict)
        .max_age(CookieDuration::seconds(auth.session_ttl.as_secs() as i64))
        .build();
    let jar = jar.add(cookie);
    Ok((
        jar,
        Json(AuthLoginResponse {
            token,
            user: account,
        }),
    ))
}

/// 登出接口：清理会话并删除 Cookie。
pub async fn auth_logout(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> (CookieJar, StatusCode) {
    if let Some(token) = request_token(&jar, bearer.as_ref()) {
        remove_session(&auth, &token).await;
    }

    (
        jar.remove(Cookie::build(AUTH_COOKIE_NAME).path("/").build()),
        StatusCode::NO_CONTENT,
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthStatus {
    id: AccountId,
    email: String,
}

/// 查询当前登录状态。
pub async fn auth_status(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Json<AuthStatus>, StatusCode> {
    if let Some(token) = request_token(&jar, bearer.as_ref())
        && let Some(user) = session_user(&auth, &token).await
    {
        return Ok(Json(AuthStatus {
            id: user.id,
            email: user.email,
        }));
    }
    Err(StatusCode::UNAUTHORIZED)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegisterOtpRequest {
    email: String,
}

/// 注册第一步：发送邮箱验证码。
pub async fn register_otp(
    Extension(registration): Extension<Arc<RegistrationService>>,
    Json(payload): Json<RegisterOtpRequest>,
) -> Result<StatusCode, ApiError> {
    registration.request_otp(&payload.email).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 注册第二步：校验验证码并创建账户。
pub async fn register(
    Extension(registration): Extension<Arc<RegistrationService>>,
    Json(payload): Json<RegistrationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let account = registration.register(payload).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

fn is_auth_exempt_path(path: &str) -> bool {
    if path.starts_with("/api/auth/") || path == "/api/version" || path.starts_with("/api/shared/") {
        return true;
    }
    !path.starts_with("/api/")
}

fn request_token(
    jar: &CookieJar,
    bearer: Option<&TypedHeader<Authorization<Bearer>>>,
) -> Option<String> {
    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME) {
        return Some(cookie.value().to_string());
    }
    bearer.map(|TypedHeader(header)| header.token().to_string())
}

async fn session_user(auth: &AuthConfig, token: &str) -> Option<CurrentUser> {
    let mut sessions = auth.sessions.lock().await;
    let now = Instant::now();
    match sessions.get(token) {
        Some(entry) if entry.expires_at > now => Some(CurrentUser {
            id: entry.account,
            email: entry.email.clone(),
        }),
        _ => {
            sessions.remove(token);
            None
        }
    }
}

async fn remove_session(auth: &AuthConfig, token: &str) {
    let mut sessions = auth.sessions.lock().await;
    sessions.remove(token);
}

async fn check_login_rate_limit(auth: &AuthConfig, ip: IpAddr) -> Option<u64> {
    if auth.login_max_attempts == 0 {
        return None;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.entry(ip).or_insert(LoginAttempt {
        window_start: now,
        failures: 0,
        locked_until: None,
    });

    if let Some(locked_until) = entry.locked_until {
        if now < locked_until {
            return Some(locked_until.saturating_duration_since(now).as_secs());
        }
        entry.locked_until = None;
        entry.failures = 0;
        entry.window_start = now;
    }

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.window_start = now;
        entry.failures = 0;
    }

    None
}

async fn register_login_failure(auth: &AuthConfig, ip: IpAddr) {
    if auth.login_max_attempts == 0 {
        return;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.entry(ip).or_insert(LoginAttempt {
        window_start: now,
        failures: 0,
        locked_until: None,
    });

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.window_start = now;
        entry.failures = 0;
        entry.locked_until = None;
    }

    entry.failures = entry.failures.saturating_add(1);
    if entry.failures >= auth.login_max_attempts {
        entry.locked_until = Some(now + auth.login_lockout);
        warn!(client_ip = %ip, "login locked out");
    }
}

async fn clear_login_failures(auth: &AuthConfig, ip: IpAddr) {
    let mut attempts = auth.login_attempts.lock().await;
    attempts.remove(&ip);
}

/// 清理过期会话。
pub async fn prune_expired_sessions(auth: &AuthConfig) {
    let mut sessions = auth.sessions.lock().await;
    let now = Instant::now();
    sessions.retain(|_, entry| entry.expires_at > now);
}

/// 清理过期的登录失败记录。
pub async fn prune_login_attempts(auth: &AuthConfig) {
    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    attempts.retain(|_, entry| {
        if let Some(locked_until) = entry.locked_until {
            return locked_until > now;
        }
        now.duration_since(entry.window_start) <= auth.login_window
    });
}
