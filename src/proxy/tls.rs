use std::{io::BufReader, path::Path, sync::Arc};

use thiserror::Error;
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        ServerConfig,
    },
    TlsAcceptor,
};

use crate::config::ListenSettings;

#[derive(Debug, Error)]
pub enum MaterialError {
    #[error("Failed to parse PEM section")]
    SectionParsingError,
    #[error("Expected a certificate")]
    ExpectedCertificate,
    #[error("Expected a private key")]
    ExpectedPrivateKey,
}

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Either the TLS chain or the private key is missing while the other is set")]
    MisconfiguredServerCertificates,
    #[error("Setting the single certificates failed: {0}")]
    ServerCertificateConfigError(#[from] tokio_rustls::rustls::Error),
    #[error("Failed during I/O: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Missing private key in the TLS private key file")]
    MissingPrivateKey,
    #[error("The TLS chain file contains no certificate")]
    EmptyChain,
    #[error("Failed to parse PEM files")]
    PEMParsingError,
    #[error("Unexpected material nature: {0}")]
    UnexpectedMaterialNature(#[from] MaterialError),
}

fn expect_certificate(item: rustls_pemfile::Item) -> Result<CertificateDer<'static>, MaterialError> {
    match item {
        rustls_pemfile::Item::X509Certificate(cert) => Ok(cert),
        _ => Err(MaterialError::ExpectedCertificate),
    }
}

fn expect_private_key(item: rustls_pemfile::Item) -> Result<PrivateKeyDer<'static>, MaterialError> {
    match item {
        rustls_pemfile::Item::Pkcs1Key(pkey) => Ok(pkey.into()),
        rustls_pemfile::Item::Sec1Key(pkey) => Ok(pkey.into()),
        rustls_pemfile::Item::Pkcs8Key(pkey) => Ok(pkey.into()),
        _ => Err(MaterialError::ExpectedPrivateKey),
    }
}

fn load_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let mut chain_file = BufReader::new(std::fs::File::open(path)?);
    let chain = rustls_pemfile::read_all(&mut chain_file)
        .map(|item| {
            item.map_err(|_| MaterialError::SectionParsingError)
                .and_then(expect_certificate)
        })
        .collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(TlsConfigError::EmptyChain);
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    let (item, _) = rustls_pemfile::read_one_from_slice(&std::fs::read(path)?)
        .map_err(|_| TlsConfigError::PEMParsingError)?
        .ok_or(TlsConfigError::MissingPrivateKey)?;
    Ok(expect_private_key(item)?)
}

/// Builds the acceptor for the TLS listener. `Ok(None)` means the proxy only
/// speaks plaintext.
pub fn build_tls_acceptor(listener: &ListenSettings) -> Result<Option<TlsAcceptor>, TlsConfigError> {
    let (chain, privkey) = match (&listener.tls_chain, &listener.tls_privkey) {
        (Some(chain), Some(privkey)) => (chain, privkey),
        // No server TLS.
        (None, None) => return Ok(None),
        _ => return Err(TlsConfigError::MisconfiguredServerCertificates),
    };

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_chain(chain)?, load_private_key(privkey)?)?;
    // CONNECT needs to take over the connection, which HTTP/2 does not allow.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
