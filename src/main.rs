//! VaultDrop server binary.
//!
//! Files are unlocked by short access codes plus an emailed one-time passcode,
//! or by time-limited sharing links. This entry point wires the stores and the
//! access control service, builds the Axum router, starts the background
//! reaper and serves HTTP (and HTTPS when a certificate is configured).

mod access;
mod accounts;
mod atomic;
mod audit;
mod auth;
mod background;
mod challenge;
mod clock;
mod codegen;
mod config;
mod error;
mod http;
mod links;
mod logging;
mod models;
mod notify;
mod reaper;
mod registration;
mod registry;
mod repository;
mod sharing;
mod storage;
#[cfg(test)]
mod test_utils;
mod tls;
mod transfers;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post, put};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::access::{AccessControlService, AccessPolicy, Collaborators};
use crate::accounts::IndexedAccountDirectory;
use crate::audit::DownloadLog;
use crate::auth::AuthConfig;
use crate::background::BackgroundTasks;
use crate::challenge::MemoryChallengeStore;
use crate::clock::{Clock, SystemClock};
use crate::codegen::{CodeGenerator, RandomCodeGenerator};
use crate::config::{ACCOUNT_INDEX_NAME, AUDIT_LOG_NAME, Args, CONTENT_DIR, FILE_INDEX_NAME};
use crate::error::ApiError;
use crate::http::{RequestScheme, build_cors_layer};
use crate::links::{LinkPolicy, MemoryLinkStore};
use crate::notify::{LogNotifier, Notifier, SmtpNotifier, SmtpSettings};
use crate::reaper::ExpiryReaper;
use crate::registration::RegistrationService;
use crate::repository::IndexedRepository;
use crate::storage::DiskStorage;

shadow!(build);

/// Starts the VaultDrop server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);
    args.validate()
        .map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;

    let storage_root = PathBuf::from(&args.storage_dir);
    let content = Arc::new(DiskStorage::new(storage_root.join(CONTENT_DIR)));
    content.ensure_root().await?;
    let repository = Arc::new(
        IndexedRepository::open(storage_root.join(FILE_INDEX_NAME))
            .await
            .map_err(io::Error::other)?,
    );
    let audit = Arc::new(
        DownloadLog::open(storage_root.join(AUDIT_LOG_NAME))
            .await
            .map_err(io::Error::other)?,
    );
    let accounts = Arc::new(
        IndexedAccountDirectory::open(storage_root.join(ACCOUNT_INDEX_NAME))
            .await
            .map_err(io::Error::other)?,
    );
    let notifier: Arc<dyn Notifier> = match &args.smtp_host {
        Some(host) => Arc::new(
            SmtpNotifier::new(&SmtpSettings {
                host: host.clone(),
                port: args.smtp_port,
                username: args.smtp_user.clone(),
                password: args.smtp_pass.clone(),
                from: args.mail_from.clone(),
            })
            .map_err(io::Error::other)?,
        ),
        None => {
            info!("smtp not configured, one-time passcodes will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let generator: Arc<dyn CodeGenerator> = Arc::new(RandomCodeGenerator);
    let otp_ttl = args.otp_ttl();
    let challenges = Arc::new(MemoryChallengeStore::new(
        clock.clone(),
        generator.clone(),
        args.otp_max_attempts,
    ));
    let links = Arc::new(MemoryLinkStore::new(
        clock.clone(),
        generator.clone(),
        LinkPolicy {
            id_length: args.link_id_length,
            max_ttl_minutes: args.link_max_ttl_minutes,
            otp_ttl,
            max_attempts: args.otp_max_attempts,
        },
    ));

    let service = Arc::new(AccessControlService::new(
        Collaborators {
            repository: repository.clone(),
            content: content.clone(),
            challenges: challenges.clone(),
            links: links.clone(),
            notifier: notifier.clone(),
            audit,
            clock: clock.clone(),
            generator,
        },
        AccessPolicy {
            otp_ttl,
            resource_lifetime: args.file_ttl(),
            access_code_length: args.access_code_length,
            max_upload_size: args.upload_max_size,
            allowed_types: args.allowed_types(),
        },
    ));
    let registration = Arc::new(RegistrationService::new(
        accounts,
        challenges.clone(),
        notifier,
        otp_ttl,
    ));
    let auth_config = Arc::new(AuthConfig::new(
        Duration::from_secs(args.session_ttl_secs),
        Duration::from_secs(args.login_window_secs),
        args.login_max_attempts,
        Duration::from_secs(args.login_lockout_secs),
    ));
    let reaper = Arc::new(ExpiryReaper::new(
        repository,
        content,
        clock,
        Duration::from_secs(args.reaper_interval_secs),
    ));

    let mut app = Router::new()
        .route("/api/auth/register/otp", post(auth::register_otp))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::auth_login))
        .route("/api/auth/logout", post(auth::auth_logout))
        .route("/api/auth/status", get(auth::auth_status))
        .route(
            "/api/files",
            put(transfers::upload_file)
                .layer(DefaultBodyLimit::disable())
                .get(transfers::list_files),
        )
        .route("/api/files/{id}", delete(transfers::delete_file))
        .route("/api/files/{id}/preview", get(transfers::preview_file))
        .route("/api/otp/owner", post(transfers::request_owner_otp))
        .route("/api/otp/owner/verify", post(transfers::verify_owner_otp))
        .route("/api/otp/download", post(transfers::request_download_otp))
        .route("/api/otp/download/verify", post(transfers::verify_download_otp))
        .route("/api/download/{code}", get(transfers::download_by_code))
        .route("/api/downloads/history", get(transfers::download_history))
        .route("/api/share/{file_id}", post(sharing::create_share_link))
        .route("/api/shared/{link_id}", post(sharing::redeem_share_link))
        .route("/api/version", get(version::get_version_info))
        .fallback(|| async { ApiError::NotFound("not found".into()) })
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(service))
        .layer(Extension(registration))
        .layer(Extension(auth_config.clone()));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let https_addr = SocketAddr::new(host, args.https_port);
    let tls_config = tls::load_rustls_config(&args).await?;
    let handle = Handle::new();

    let http_app = app.clone().layer(Extension(RequestScheme::Http));
    let https_app = app.layer(Extension(RequestScheme::Https));

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(http_app.into_make_service_with_connect_info::<SocketAddr>());
    let https_handle = handle.clone();
    let https_server = async move {
        match tls_config {
            Some(tls_config) => {
                info!("Starting HTTPS server at {}", https_addr);
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(https_handle)
                    .serve(https_app.into_make_service_with_connect_info::<SocketAddr>())
                    .await
            }
            None => std::future::pending::<io::Result<()>>().await,
        }
    };

    let tasks = BackgroundTasks::spawn(reaper, challenges, links, auth_config);
    let served = tokio::select! {
        result = http_server => result,
        result = https_server => result,
        _ = shutdown_signal(handle) => Ok(()),
    };
    tasks.shutdown().await;
    served
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
