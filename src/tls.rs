//! TLS 证书加载：仅在同时提供证书与私钥时启用 HTTPS。

use axum_server::tls_rustls::RustlsConfig;
use std::io;
use std::path::Path;
use tracing::info;

use crate::config::Args;

/// 构建 Rustls 配置；未配置证书时返回 `None`。
pub async fn load_rustls_config(args: &Args) -> io::Result<Option<RustlsConfig>> {
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let config = RustlsConfig::from_pem_file(Path::new(cert), Path::new(key)).await?;
            info!(cert, "tls certificate loaded");
            Ok(Some(config))
        }
        (None, None) => Ok(None),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tls cert and key must be given together",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn no_certificate_means_plain_http() {
        let args = Args::parse_from(["vaultdrop"]);
        assert!(load_rustls_config(&args).await.expect("config").is_none());
    }

    #[tokio::test]
    async fn missing_certificate_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cert = temp.path().join("cert.pem");
        let key = temp.path().join("key.pem");
        let args = Args::parse_from([
            "vaultdrop",
            "--tls-cert",
            cert.to_str().expect("utf8 path"),
            "--tls-key",
            key.to_str().expect("utf8 path"),
        ]);
        assert!(load_rustls_config(&args).await.is_err());
    }
}
