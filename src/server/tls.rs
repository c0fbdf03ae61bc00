//! TLS termination.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::config::{Protocol, TlsConfig};
use crate::error::Error;

/// Builds an acceptor from PEM files. ALPN offers `h2` and `http/1.1`
/// according to the protocol mode.
pub(crate) fn acceptor(tls: &TlsConfig, protocol: Protocol) -> Result<TlsAcceptor, Error> {
    let mut reader = BufReader::new(open(&tls.cert)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| Error::Tls(format!("{}: {e}", tls.cert.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("{}: no certificate found", tls.cert.display())));
    }

    let mut reader = BufReader::new(open(&tls.key)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("{}: {e}", tls.key.display())))?
        .ok_or_else(|| Error::Tls(format!("{}: no private key found", tls.key.display())))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;

    config.alpn_protocols = match protocol {
        Protocol::Http1 => vec![b"http/1.1".to_vec()],
        Protocol::Http2 => vec![b"h2".to_vec()],
        Protocol::Auto => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &std::path::Path) -> Result<File, Error> {
    File::open(path).map_err(|e| Error::Tls(format!("{}: {e}", path.display())))
}
