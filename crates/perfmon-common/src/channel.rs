//! Length-prefixed message channel over an authenticated stream.
//!
//! Each message is `[u32 big-endian length][payload]`; the length excludes the
//! prefix. In production the stream is a rustls `TlsStream` produced by
//! [`crate::tls`], in tests any in-memory duplex pipe works.

use crate::error::{PipelineError, ProtocolViolation};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::length_delimited::LengthDelimitedCodecError;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

pub struct SecureChannel<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    max_message_bytes: usize,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, max_message_bytes: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_message_bytes)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
            max_message_bytes,
        }
    }

    /// Writes one message and flushes it to the underlying stream.
    pub async fn send(&mut self, payload: Bytes) -> Result<(), PipelineError> {
        if payload.len() > self.max_message_bytes {
            return Err(ProtocolViolation::Oversized {
                max: self.max_message_bytes,
            }
            .into());
        }
        self.framed
            .send(payload)
            .await
            .map_err(|e| self.classify(e))
    }

    /// Reads the next message. `Ok(None)` means the peer closed the stream
    /// cleanly between messages.
    pub async fn receive(&mut self) -> Result<Option<Bytes>, PipelineError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e))
                if e.kind() == io::ErrorKind::UnexpectedEof
                    && self.framed.read_buffer().is_empty() =>
            {
                // TLS peers that drop the socket without close_notify.
                Ok(None)
            }
            Some(Err(e)) => Err(self.classify(e)),
        }
    }

    /// Flushes pending writes and shuts down the write half (sends TLS
    /// close_notify when running over TLS).
    pub async fn close(&mut self) -> Result<(), PipelineError> {
        SinkExt::<Bytes>::close(&mut self.framed)
            .await
            .map_err(|e| self.classify(e))
    }

    pub fn get_ref(&self) -> &S {
        self.framed.get_ref()
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    fn classify(&self, err: io::Error) -> PipelineError {
        let oversized = err
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        if oversized {
            return ProtocolViolation::Oversized {
                max: self.max_message_bytes,
            }
            .into();
        }
        PipelineError::from_tls_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn messages_arrive_in_order_then_end_of_stream() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = SecureChannel::new(a, DEFAULT_MAX_MESSAGE_BYTES);
        let mut server = SecureChannel::new(b, DEFAULT_MAX_MESSAGE_BYTES);

        client.send(Bytes::from_static(b"first")).await.unwrap();
        client.send(Bytes::new()).await.unwrap();
        client.send(Bytes::from_static(b"third")).await.unwrap();
        client.close().await.unwrap();
        drop(client);

        assert_eq!(server.receive().await.unwrap().unwrap(), "first");
        assert_eq!(server.receive().await.unwrap().unwrap(), "");
        assert_eq!(server.receive().await.unwrap().unwrap(), "third");
        assert!(server.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn length_prefix_is_four_bytes_big_endian() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut client = SecureChannel::new(a, 64);
        client.send(Bytes::from_static(b"abc")).await.unwrap();

        let mut raw = [0u8; 7];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut raw)
            .await
            .unwrap();
        assert_eq!(&raw, &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn oversized_outgoing_message_is_refused_locally() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut client = SecureChannel::new(a, 8);
        let err = client.send(Bytes::from(vec![0u8; 9])).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ProtocolViolation(ProtocolViolation::Oversized { max: 8 })
        ));
    }

    #[tokio::test]
    async fn oversized_incoming_message_is_protocol_violation() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut server = SecureChannel::new(b, 16);
        a.write_all(&1000u32.to_be_bytes()).await.unwrap();
        a.write_all(&[0u8; 32]).await.unwrap();

        let err = server.receive().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn close_mid_message_is_an_error_not_data() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut server = SecureChannel::new(b, 1024);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"half").await.unwrap();
        drop(a);

        assert!(server.receive().await.is_err());
    }
}
