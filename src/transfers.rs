//! 文件上传、列表、删除、验证码与按访问码下载的处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Path, Query, connect_info::ConnectInfo};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::info;

use crate::access::{AccessControlService, Download, OwnedPage};
use crate::auth::CurrentUser;
use crate::config::DEFAULT_LIST_LIMIT;
use crate::error::ApiError;
use crate::http::resolve_client_ip;
use crate::models::{DownloadRecord, FileResource, ResourceId};

/// 对外展示的文件信息，不含存储定位符。
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileView {
    id: ResourceId,
    original_name: String,
    size: u64,
    access_code: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<FileResource> for FileView {
    fn from(resource: FileResource) -> Self {
        Self {
            id: resource.id,
            original_name: resource.original_name,
            size: resource.size,
            access_code: resource.access_code,
            created_at: resource.created_at,
            expires_at: resource.expires_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FilePage {
    files: Vec<FileView>,
    total: usize,
    page: usize,
    total_pages: usize,
}

impl From<OwnedPage> for FilePage {
    fn from(page: OwnedPage) -> Self {
        Self {
            files: page.files.into_iter().map(FileView::from).collect(),
            total: page.total,
            page: page.page,
            total_pages: page.total_pages,
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct UploadQuery {
    name: String,
}

#[derive(Deserialize)]
pub(crate) struct PageQuery {
    page: Option<usize>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OtpRequestBody {
    email: Option<String>,
    access_code: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OtpVerifyBody {
    email: Option<String>,
    access_code: String,
    otp: String,
}

#[derive(Deserialize)]
pub(crate) struct DownloadQuery {
    email: Option<String>,
}

/// 上传文件：请求体为原始内容，文件名来自查询参数。
pub async fn upload_file(
    Query(UploadQuery { name }): Query<UploadQuery>,
    Extension(service): Extension<Arc<AccessControlService>>,
    Extension(user): Extension<CurrentUser>,
    body: AxumBody,
) -> Result<(StatusCode, JsonResponse<FileView>), ApiError> {
    let stream = BodyExt::into_data_stream(body)
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let resource = service
        .upload(user.id, &name, Box::new(StreamReader::new(stream)))
        .await?;
    info!(
        id = %resource.id,
        size = resource.size,
        owner = %user.id,
        "file uploaded"
    );
    Ok((StatusCode::CREATED, JsonResponse(resource.into())))
}

/// 分页列出当前用户的文件。
pub async fn list_files(
    Query(query): Query<PageQuery>,
    Extension(service): Extension<Arc<AccessControlService>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<JsonResponse<FilePage>, ApiError> {
    let page = service
        .list_owned(
            user.id,
            query.page.unwrap_or(1),
            query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        )
        .await?;
    Ok(JsonResponse(page.into()))
}

pub async fn delete_file(
    Path(id): Path<String>,
    Extension(service): Extension<Arc<AccessControlService>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<StatusCode, ApiError> {
    service.delete_resource(user.id, parse_resource_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 所有者内联预览。
pub async fn preview_file(
    Path(id): Path<String>,
    Extension(service): Extension<Arc<AccessControlService>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Response, ApiError> {
    let preview = service.preview_resource(user.id, parse_resource_id(&id)?).await?;
    stream_download(preview, false)
}

pub async fn request_owner_otp(
    Extension(service): Extension<Arc<AccessControlService>>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<OtpRequestBody>,
) -> Result<StatusCode, ApiError> {
    let email = payload.email.unwrap_or(user.email);
    service
        .request_owner_otp(user.id, &email, &payload.access_code)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn verify_owner_otp(
    Extension(service): Extension<Arc<AccessControlService>>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<OtpVerifyBody>,
) -> Result<StatusCode, ApiError> {
    let email = payload.email.unwrap_or(user.email);
    service
        .verify_owner_otp(&email, &payload.access_code, &payload.otp)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn request_download_otp(
    Extension(service): Extension<Arc<AccessControlService>>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<OtpRequestBody>,
) -> Result<StatusCode, ApiError> {
    let email = payload.email.unwrap_or(user.email);
    service
        .request_download_otp(&email, &payload.access_code)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn verify_download_otp(
    Extension(service): Extension<Arc<AccessControlService>>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<OtpVerifyBody>,
) -> Result<StatusCode, ApiError> {
    let email = payload.email.unwrap_or(user.email);
    service
        .verify_download_otp(&email, &payload.access_code, &payload.otp)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 按访问码下载，要求该邮箱已完成验证码校验。
pub async fn download_by_code(
    Path(code): Path<String>,
    Query(query): Query<DownloadQuery>,
    Extension(service): Extension<Arc<AccessControlService>>,
    Extension(user): Extension<CurrentUser>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let email = query.email.unwrap_or_else(|| user.email.clone());
    let origin = resolve_client_ip(&headers, Some(addr.ip()));
    let download = service.download(user.id, &email, &code, origin).await?;
    stream_download(download, true)
}

pub async fn download_history(
    Extension(service): Extension<Arc<AccessControlService>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<JsonResponse<Vec<DownloadRecord>>, ApiError> {
    Ok(JsonResponse(service.download_history(user.id).await?))
}

fn parse_resource_id(raw: &str) -> Result<ResourceId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest("invalid file id".into()))
}

/// 把授权后的内容写成流式响应。
pub(crate) fn stream_download(download: Download, attachment: bool) -> Result<Response, ApiError> {
    let Download { resource, content } = download;
    let mime = mime_guess::from_path(&resource.original_name).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&resource.size.to_string())
            .map_err(|_| ApiError::Internal("response header build failed".into()))?,
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&resource.original_name, attachment))
            .map_err(|_| ApiError::Internal("response header build failed".into()))?,
    );

    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(content)),
    )
        .into_response())
}

/// ASCII 回退名加 RFC 5987 编码的原名。
fn content_disposition(name: &str, attachment: bool) -> String {
    let kind = if attachment { "attachment" } else { "inline" };
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut encoded = String::with_capacity(name.len() * 3);
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("{kind}; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
