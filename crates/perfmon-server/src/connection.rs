use perfmon_common::error::ProtocolViolation;
use perfmon_common::tls::PeerSession;
use perfmon_common::types::{Batch, ClientIdentity};

/// Server-side state of one authenticated client connection.
#[derive(Debug, Clone)]
pub struct Connection {
    identity: ClientIdentity,
    protocol: String,
    cipher_suite: String,
    /// 0 until the first batch is acknowledged; sequences start at 1.
    last_acknowledged: u64,
    accepted: u64,
}

impl Connection {
    pub fn new(
        identity: ClientIdentity,
        protocol: impl Into<String>,
        cipher_suite: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            protocol: protocol.into(),
            cipher_suite: cipher_suite.into(),
            last_acknowledged: 0,
            accepted: 0,
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn cipher_suite(&self) -> &str {
        &self.cipher_suite
    }

    pub fn last_acknowledged(&self) -> u64 {
        self.last_acknowledged
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Checks that `batch` may be forwarded: it must be attributed to the
    /// authenticated identity and carry a sequence above the last one
    /// acknowledged.
    pub fn check(&self, batch: &Batch) -> Result<(), ProtocolViolation> {
        if batch.client != self.identity {
            return Err(ProtocolViolation::IdentityMismatch {
                authenticated: self.identity.to_string(),
                claimed: batch.client.to_string(),
            });
        }
        if batch.sequence <= self.last_acknowledged {
            return Err(ProtocolViolation::SequenceRegression {
                last: self.last_acknowledged,
                received: batch.sequence,
            });
        }
        Ok(())
    }

    /// Records a batch the sink has accepted.
    pub fn acknowledge(&mut self, sequence: u64) {
        self.last_acknowledged = sequence;
        self.accepted += 1;
    }
}

impl From<PeerSession> for Connection {
    fn from(peer: PeerSession) -> Self {
        Self::new(peer.identity, peer.protocol, peer.cipher_suite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(client: &str, sequence: u64) -> Batch {
        Batch {
            sequence,
            client: ClientIdentity::new(client),
            samples: Vec::new(),
        }
    }

    #[test]
    fn sequences_must_strictly_increase() {
        let mut conn = Connection::new(ClientIdentity::new("svc"), "TLSv1_3", "AES_256");
        assert!(conn.check(&batch("svc", 1)).is_ok());
        conn.acknowledge(1);
        // Gaps are fine.
        assert!(conn.check(&batch("svc", 4)).is_ok());
        conn.acknowledge(4);

        assert_eq!(
            conn.check(&batch("svc", 4)),
            Err(ProtocolViolation::SequenceRegression {
                last: 4,
                received: 4
            })
        );
        assert!(conn.check(&batch("svc", 2)).is_err());
        assert_eq!(conn.accepted(), 2);
        assert_eq!(conn.last_acknowledged(), 4);
    }

    #[test]
    fn zero_sequence_is_never_valid() {
        let conn = Connection::new(ClientIdentity::new("svc"), "", "");
        assert!(conn.check(&batch("svc", 0)).is_err());
    }

    #[test]
    fn batch_must_match_authenticated_identity() {
        let conn = Connection::new(ClientIdentity::new("svc"), "", "");
        let err = conn.check(&batch("impostor", 1)).unwrap_err();
        assert!(matches!(err, ProtocolViolation::IdentityMismatch { .. }));
    }
}
