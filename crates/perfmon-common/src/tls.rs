//! Mutual-TLS setup: PEM loading, rustls configs and peer identity.
//!
//! Both ends trust exactly one CA bundle. The server requires a client
//! certificate chained to it; the client verifies the server name against it.

use crate::channel::SecureChannel;
use crate::error::PipelineError;
use crate::types::ClientIdentity;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Paths to the already-issued PEM material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum TlsSetupError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid server name '{0}'")]
    InvalidServerName(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error(transparent)]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// What the server learns about a peer once the handshake completes.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub identity: ClientIdentity,
    pub protocol: String,
    pub cipher_suite: String,
}

fn open(path: &Path) -> Result<BufReader<File>, TlsSetupError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsSetupError::Io {
            path: path.to_path_buf(),
            source,
        })
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsSetupError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsSetupError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Loads the first PKCS#8, PKCS#1 or SEC1 key in the file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsSetupError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsSetupError::NoPrivateKey(path.to_path_buf()))
}

pub fn load_roots(path: &Path) -> Result<RootCertStore, TlsSetupError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn client_config(files: &TlsFiles) -> Result<Arc<ClientConfig>, TlsSetupError> {
    let roots = load_roots(&files.ca_path)?;
    let certs = load_certs(&files.cert_path)?;
    let key = load_private_key(&files.key_path)?;
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;
    Ok(Arc::new(config))
}

pub fn server_config(files: &TlsFiles) -> Result<Arc<ServerConfig>, TlsSetupError> {
    let roots = Arc::new(load_roots(&files.ca_path)?);
    let certs = load_certs(&files.cert_path)?;
    let key = load_private_key(&files.key_path)?;
    let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider()).build()?;
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

pub fn server_name(name: &str) -> Result<ServerName<'static>, TlsSetupError> {
    ServerName::try_from(name.to_string())
        .map_err(|_| TlsSetupError::InvalidServerName(name.to_string()))
}

/// Identity carried by a certificate: its subject common name, or the whole
/// subject DN when there is no CN.
pub fn identity_from_certificate(der: &CertificateDer<'_>) -> Result<ClientIdentity, TlsSetupError> {
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| TlsSetupError::InvalidCertificate(e.to_string()))?;
    let subject = cert.subject();
    let name = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| subject.to_string());
    if name.is_empty() {
        return Err(TlsSetupError::InvalidCertificate(
            "certificate has an empty subject".to_string(),
        ));
    }
    Ok(ClientIdentity::new(name))
}

/// The identity this process presents, read from its own leaf certificate.
pub fn local_identity(files: &TlsFiles) -> Result<ClientIdentity, TlsSetupError> {
    let certs = load_certs(&files.cert_path)?;
    identity_from_certificate(&certs[0])
}

/// Dials `addr` and runs the client side of the handshake.
pub async fn connect(
    connector: &TlsConnector,
    addr: &str,
    server_name: ServerName<'static>,
    max_message_bytes: usize,
) -> Result<SecureChannel<client::TlsStream<TcpStream>>, PipelineError> {
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(PipelineError::from_tls_io)?;
    let (_, session) = tls.get_ref();
    tracing::debug!(
        addr,
        protocol = ?session.protocol_version(),
        "TLS handshake completed"
    );
    Ok(SecureChannel::new(tls, max_message_bytes))
}

/// Runs the server side of the handshake on an accepted socket and extracts
/// the verified client identity.
pub async fn accept(
    acceptor: &TlsAcceptor,
    tcp: TcpStream,
    max_message_bytes: usize,
) -> Result<(SecureChannel<server::TlsStream<TcpStream>>, PeerSession), PipelineError> {
    let tls = acceptor
        .accept(tcp)
        .await
        .map_err(PipelineError::from_tls_io)?;
    let (_, session) = tls.get_ref();
    let leaf = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| {
            PipelineError::AuthenticationFailure("client presented no certificate".to_string())
        })?;
    let identity = identity_from_certificate(leaf)
        .map_err(|e| PipelineError::AuthenticationFailure(e.to_string()))?;
    let peer = PeerSession {
        identity,
        protocol: session
            .protocol_version()
            .map(|v| format!("{v:?}"))
            .unwrap_or_default(),
        cipher_suite: session
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_default(),
    };
    Ok((SecureChannel::new(tls, max_message_bytes), peer))
}
