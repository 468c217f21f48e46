//! TLS material for the hub listeners
//!
//! Both the gateway and the API listener terminate TLS with the same rules:
//! an operator-supplied PEM certificate and key, or, when both paths are
//! left blank, a freshly generated self-signed certificate for `localhost`.
//! The generated pair lives only in memory and disappears with the process.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tracing::info;

use crate::{HubError, Result};

/// Build a server TLS configuration from optional PEM paths.
///
/// Supplying exactly one of the two paths is a configuration error.
pub fn server_config(
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
) -> Result<Arc<ServerConfig>> {
    let config = match (cert_path, key_path) {
        (Some(cert), Some(key)) => load_config(cert, key)?,
        (None, None) => self_signed_config()?,
        _ => {
            return Err(HubError::invalid_argument(
                "tls cert and key paths must be supplied together",
            ))
        }
    };

    Ok(Arc::new(config))
}

fn load_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<CertificateDer<'static>>, _>>()?;
    if certs.is_empty() {
        return Err(HubError::invalid_argument(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
        HubError::invalid_argument(format!("no private key found in {}", key_path.display()))
    })?;

    info!(cert = %cert_path.display(), key = %key_path.display(), "loaded TLS key pair");

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

fn self_signed_config() -> Result<ServerConfig> {
    let key_pair = rcgen::KeyPair::generate()?;
    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()])?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "localhost");
    let cert = params.self_signed(&key_pair)?;

    info!("generated self-signed TLS certificate for localhost");

    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_self_signed_when_both_paths_blank() {
        let config = server_config(None, None).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_single_path_is_rejected() {
        let result = server_config(Some(Path::new("/tmp/cert.pem")), None);
        assert!(matches!(result, Err(HubError::InvalidArgument(_))));
    }

    #[test]
    fn test_missing_files_fail() {
        let result = server_config(
            Some(Path::new("/nonexistent/cert.pem")),
            Some(Path::new("/nonexistent/key.pem")),
        );
        assert!(matches!(result, Err(HubError::Io(_))));
    }

    #[test]
    fn test_load_generated_pem_pair() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        File::create(&cert_path)
            .unwrap()
            .write_all(cert.pem().as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(key_pair.serialize_pem().as_bytes())
            .unwrap();

        let config = server_config(Some(&cert_path), Some(&key_path));
        assert!(config.is_ok());
    }
}
