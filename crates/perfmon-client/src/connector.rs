use crate::config::ClientConfig;
use async_trait::async_trait;
use perfmon_common::channel::SecureChannel;
use perfmon_common::error::PipelineError;
use perfmon_common::tls::{self, TlsSetupError};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{client, TlsConnector};

/// Opens an authenticated channel to the ingest server. Called again for
/// every reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> Result<SecureChannel<Self::Stream>, PipelineError>;
}

/// TCP + mutual TLS, using the credentials loaded at startup.
pub struct TlsClientConnector {
    connector: TlsConnector,
    addr: String,
    server_name: ServerName<'static>,
    max_message_bytes: usize,
}

impl TlsClientConnector {
    pub fn from_config(config: &ClientConfig) -> Result<Self, TlsSetupError> {
        Ok(Self {
            connector: TlsConnector::from(tls::client_config(&config.tls)?),
            addr: config.server_addr.clone(),
            server_name: tls::server_name(&config.server_name)?,
            max_message_bytes: config.max_message_bytes,
        })
    }
}

#[async_trait]
impl Connector for TlsClientConnector {
    type Stream = client::TlsStream<TcpStream>;

    async fn connect(&self) -> Result<SecureChannel<Self::Stream>, PipelineError> {
        tls::connect(
            &self.connector,
            &self.addr,
            self.server_name.clone(),
            self.max_message_bytes,
        )
        .await
    }
}
