//! 分享链接：创建（需登录）与兑换（匿名）。

use axum::extract::{Extension, Json, Path, connect_info::ConnectInfo};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Json as JsonResponse, Response};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::access::AccessControlService;
use crate::auth::CurrentUser;
use crate::config::DEFAULT_LINK_TTL_MINUTES;
use crate::error::ApiError;
use crate::http::resolve_client_ip;
use crate::links::CreatedLink;
use crate::models::ResourceId;
use crate::transfers::stream_download;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct CreateLinkBody {
    expires_in_minutes: Option<u32>,
    otp_required: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub(crate) struct RedeemLinkBody {
    otp: Option<String>,
}

/// 为自己的文件创建分享链接；需要验证码时验证码只在此处返回一次。
pub async fn create_share_link(
    Path(file_id): Path<String>,
    Extension(service): Extension<Arc<AccessControlService>>,
    Extension(user): Extension<CurrentUser>,
    body: Option<Json<CreateLinkBody>>,
) -> Result<(StatusCode, JsonResponse<CreatedLink>), ApiError> {
    let Json(body) = body.unwrap_or_default();
    let resource: ResourceId = file_id
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid file id".into()))?;
    let created = service
        .create_share_link(
            user.id,
            resource,
            body.expires_in_minutes.unwrap_or(DEFAULT_LINK_TTL_MINUTES),
            body.otp_required,
        )
        .await?;
    Ok((StatusCode::CREATED, JsonResponse(created)))
}

/// 匿名兑换分享链接并返回文件内容。
pub async fn redeem_share_link(
    Path(link_id): Path<String>,
    Extension(service): Extension<Arc<AccessControlService>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<RedeemLinkBody>>,
) -> Result<Response, ApiError> {
    let Json(body) = body.unwrap_or_default();
    let origin = resolve_client_ip(&headers, Some(addr.ip()));
    let download = service
        .redeem_share_link(&link_id, body.otp.as_deref(), origin)
        .await?;
    stream_download(download, true)
}
