//! TLS origination towards `https` backends.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use super::config::UpstreamProtocol;
use crate::error::Error;

/// Builds a connector trusting only the roots in `ca`. ALPN asks for the
/// backend's protocol.
pub(crate) fn connector(ca: &Path, protocol: UpstreamProtocol) -> Result<TlsConnector, Error> {
    let file = File::open(ca).map_err(|e| Error::Tls(format!("{}: {e}", ca.display())))?;
    let mut reader = BufReader::new(file);

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| Error::Tls(format!("{}: {e}", ca.display())))?;
        roots.add(cert).map_err(|e| Error::Tls(format!("{}: {e}", ca.display())))?;
    }
    if roots.is_empty() {
        return Err(Error::Tls(format!("{}: no certificate found", ca.display())));
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = match protocol {
        UpstreamProtocol::Http1 => vec![b"http/1.1".to_vec()],
        UpstreamProtocol::Http2 => vec![b"h2".to_vec()],
    };
    Ok(TlsConnector::from(Arc::new(config)))
}
