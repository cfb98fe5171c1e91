//! TLS acceptor for RPC trigger servers

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use super::rpc::TlsOptions;

/// Build an acceptor from PEM certificate and key files
pub fn load_acceptor(options: &TlsOptions) -> Result<TlsAcceptor, String> {
    let certs = load_certs(Path::new(&options.cert))?;
    let key = load_private_key(Path::new(&options.key))?;

    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("Invalid TLS protocol configuration: {}", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("Invalid TLS configuration: {}", e))?;

    info!(cert = %options.cert, "Loaded TLS configuration");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, String> {
    let file = File::open(path)
        .map_err(|e| format!("Failed to open certificate file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Failed to parse certificates: {}", e))?;

    if certs.is_empty() {
        return Err(format!("No certificates found in {}", path.display()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, String> {
    let file = File::open(path)
        .map_err(|e| format!("Failed to open private key file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| format!("Failed to parse private key: {}", e))?
        .ok_or_else(|| format!("No private key found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_files() {
        let err = load_acceptor(&TlsOptions {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        })
        .err()
        .unwrap();
        assert!(err.contains("Failed to open certificate file"));
    }

    #[test]
    fn test_empty_files() {
        let cert = NamedTempFile::new().unwrap();
        assert!(load_certs(cert.path()).unwrap_err().contains("No certificates"));
        let key = NamedTempFile::new().unwrap();
        assert!(load_private_key(key.path()).unwrap_err().contains("No private key"));
    }
}
