//! TLS connector assembly for the gateway link.

use anyhow::{Context, Result};
use native_tls::{Certificate, Protocol};
use tokio::net::TcpStream;
use tokio_native_tls::{TlsConnector, TlsStream};

use secrux_core::config::ExecutorConfig;

/// Build the TLS connector: TLS 1.2 minimum, optional private CA, optional
/// verification bypass for dev gateways.
pub fn build_tls_connector(config: &ExecutorConfig) -> Result<TlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();
    builder.min_protocol_version(Some(Protocol::Tlsv12));

    if config.insecure {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if !config.ca_cert_path.is_empty() {
        let pem = std::fs::read(&config.ca_cert_path)
            .with_context(|| format!("reading CA certificate {}", config.ca_cert_path))?;
        let cert = Certificate::from_pem(&pem)
            .with_context(|| format!("failed to parse CA certificate {}", config.ca_cert_path))?;
        builder.add_root_certificate(cert);
    }

    Ok(builder.build().context("building TLS connector")?.into())
}

/// Dial the gateway and complete the TLS handshake.
pub async fn connect(config: &ExecutorConfig) -> Result<TlsStream<TcpStream>> {
    let connector = build_tls_connector(config)?;
    let tcp = TcpStream::connect(&config.server_addr)
        .await
        .with_context(|| format!("connecting to gateway {}", config.server_addr))?;

    // Certificate verification uses the explicit server name when set,
    // otherwise the host part of the gateway address.
    let domain = if config.server_name.is_empty() {
        config
            .server_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(config.server_addr.as_str())
            .to_string()
    } else {
        config.server_name.clone()
    };

    connector
        .connect(&domain, tcp)
        .await
        .with_context(|| format!("TLS handshake with {domain} failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_connector_builds() {
        let config = ExecutorConfig {
            insecure: true,
            ..ExecutorConfig::default()
        };
        assert!(build_tls_connector(&config).is_ok());
    }

    #[test]
    fn test_missing_ca_file_is_fatal() {
        let config = ExecutorConfig {
            ca_cert_path: "/nonexistent/ca.pem".to_string(),
            ..ExecutorConfig::default()
        };
        assert!(build_tls_connector(&config).is_err());
    }
}
