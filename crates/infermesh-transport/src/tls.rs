use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use infermesh_commons::utils::config::TlsConfig;
use rustls::pki_types::{
    CertificateDer,
    PrivateKeyDer,
};
use rustls::RootCertStore;

use crate::error::TransportError;

pub type TlsClientConfig = Arc<rustls::ClientConfig>;

/// Builds a client TLS config from PEM paths: the CA bundle becomes the root
/// store, and cert/key enable mutual auth when both are present.
pub fn load_tls_client_config(tls: &TlsConfig) -> Result<TlsClientConfig, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(&tls.ca_path)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = if tls.cert_path.is_empty() || tls.key_path.is_empty() {
        builder.with_no_client_auth()
    } else {
        let certs = read_certs(&tls.cert_path)?;
        let key = read_key(&tls.key_path)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| TransportError::Tls(e.to_string()))?
    };
    Ok(Arc::new(config))
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|source| TransportError::Connect {
        addr: path.to_string(),
        source,
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(e.to_string()))
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path).map_err(|source| TransportError::Connect {
        addr: path.to_string(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .ok_or_else(|| TransportError::Tls(format!("no private key in {path}")))
}
