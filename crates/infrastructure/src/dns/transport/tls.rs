//! TLS Transport for DNS queries, DNS-over-TLS (RFC 7858)
//!
//! One `ClientConfig` is built per forwarder and shared by every TLS
//! upstream. Trust roots come from `ca_file` when configured and from the
//! bundled web PKI roots otherwise. A client certificate is presented when
//! `cert_file` and `key_file` are both set.

use super::map_io_error;
use fdyn_domain::{DomainError, TlsConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

#[derive(Clone)]
pub struct TlsDialer {
    connector: TlsConnector,
    server_name: Option<String>,
}

impl TlsDialer {
    pub fn from_config(config: &TlsConfig) -> Result<Self, DomainError> {
        let roots = load_root_store(config.ca_file.as_deref())?;
        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

        let client_config = match (&config.cert_file, &config.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let certs = load_certs(cert_file)?;
                let key = load_private_key(key_file)?;
                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    DomainError::TlsError(format!("Invalid client certificate: {}", e))
                })?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name: config.server_name.clone(),
        })
    }

    /// Name verified against the upstream certificate. Falls back to the
    /// upstream IP when no `server_name` is configured.
    pub fn server_name_for(&self, server_addr: SocketAddr) -> Result<ServerName<'static>, DomainError> {
        let name = self
            .server_name
            .clone()
            .unwrap_or_else(|| server_addr.ip().to_string());
        ServerName::try_from(name.clone())
            .map_err(|e| DomainError::TlsError(format!("Invalid server name '{}': {}", name, e)))
    }

    pub async fn connect(
        &self,
        server_addr: SocketAddr,
        timeout: Duration,
    ) -> Result<TlsStream<TcpStream>, DomainError> {
        let server_name = self.server_name_for(server_addr)?;
        let tcp_stream = super::tcp::connect(server_addr, timeout).await?;

        let tls_stream = tokio::time::timeout(timeout, self.connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| DomainError::TransportTimeout {
                server: server_addr.to_string(),
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::InvalidData => DomainError::TlsError(format!(
                    "TLS handshake with {} failed: {}",
                    server_addr, e
                )),
                _ => map_io_error(e, server_addr),
            })?;

        debug!(server = %server_addr, "TLS connection established");
        Ok(tls_stream)
    }
}

fn load_root_store(ca_file: Option<&str>) -> Result<RootCertStore, DomainError> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(|e| {
                    DomainError::TlsError(format!("Invalid CA certificate in {}: {}", path, e))
                })?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

fn open_pem(path: &str) -> Result<BufReader<File>, DomainError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| DomainError::TlsError(format!("Failed to open {}: {}", path, e)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, DomainError> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DomainError::TlsError(format!("Failed to read certificates from {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(DomainError::TlsError(format!("No certificates found in {}", path)));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, DomainError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| DomainError::TlsError(format!("Failed to read private key from {}: {}", path, e)))?
        .ok_or_else(|| DomainError::TlsError(format!("No private key found in {}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_falls_back_to_ip() {
        let dialer = TlsDialer::from_config(&TlsConfig::default()).unwrap();
        let addr: SocketAddr = "9.9.9.9:853".parse().unwrap();
        let name = dialer.server_name_for(addr).unwrap();
        assert!(matches!(name, ServerName::IpAddress(_)));
    }

    #[test]
    fn test_configured_server_name_is_used() {
        let config = TlsConfig {
            server_name: Some("dns.quad9.net".to_string()),
            ..Default::default()
        };
        let dialer = TlsDialer::from_config(&config).unwrap();
        let addr: SocketAddr = "9.9.9.9:853".parse().unwrap();
        let name = dialer.server_name_for(addr).unwrap();
        assert!(matches!(name, ServerName::DnsName(_)));
    }

    #[test]
    fn test_missing_ca_file_is_an_error() {
        let config = TlsConfig {
            ca_file: Some("/nonexistent/ca.pem".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            TlsDialer::from_config(&config),
            Err(DomainError::TlsError(_))
        ));
    }
}
