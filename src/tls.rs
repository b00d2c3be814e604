use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio_rustls::TlsAcceptor;

/// Builds the STARTTLS acceptor from a PEM certificate chain and PKCS#8 key.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = &mut std::fs::File::open(cert_path)
        .with_context(|| format!("Failed to open certificate: {:?}", cert_path))?;
    let cert_chain: Vec<Certificate> = certs(&mut BufReader::new(cert_file))
        .map_err(|_| anyhow::anyhow!("Failed to parse certificate"))?
        .into_iter()
        .map(Certificate)
        .collect();

    if cert_chain.is_empty() {
        return Err(anyhow::anyhow!("No certificate found in {:?}", cert_path));
    }

    let key_file = &mut std::fs::File::open(key_path)
        .with_context(|| format!("Failed to open private key: {:?}", key_path))?;
    let mut keys = pkcs8_private_keys(&mut BufReader::new(key_file))
        .map_err(|_| anyhow::anyhow!("Failed to parse private key"))?;

    if keys.is_empty() {
        return Err(anyhow::anyhow!("No private key found"));
    }

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, PrivateKey(keys.remove(0)))
        .map_err(|e| anyhow::anyhow!("Failed to build TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_acceptor(&dir.path().join("cert.pem"), &dir.path().join("key.pem"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to open certificate"));
    }

    #[test]
    fn test_empty_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(&cert, "").unwrap();
        let err = load_acceptor(&cert, &dir.path().join("key.pem")).err().unwrap();
        assert!(err.to_string().contains("No certificate found"));
    }
}
