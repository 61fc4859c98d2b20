/// Cryptographic operation errors.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid nonce length: expected {expected}, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },
    #[error("aead: tag verification failed")]
    AeadTagVerifyFail,
    #[error("aead: encryption failed")]
    AeadSealFail,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("kdf: derived key length overflow")]
    KdfDkLenOverflow,
    #[error("random generator failure")]
    RandomFail,
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

/// Protocol engine errors.
///
/// Unit-level variants (`MalformedUnit`, `MissingField`, `ApplyFailed`) are
/// caught at layer boundaries and turned into "different units observed";
/// only the transport class aborts a workflow.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed {unit}: cannot read `{field}` at offset {offset}")]
    MalformedUnit {
        unit: &'static str,
        field: &'static str,
        offset: usize,
    },
    #[error("{unit}: field `{field}` has no value")]
    MissingField {
        unit: &'static str,
        field: &'static str,
    },
    #[error("incomplete reassembly of message {sequence}: {missing} of {total} bytes uncovered")]
    IncompleteReassembly {
        sequence: u64,
        missing: usize,
        total: usize,
    },
    #[error("overlap conflict in message {sequence} at offset {offset}")]
    OverlapConflict { sequence: u64, offset: usize },
    #[error("applying {unit} to connection state failed: {reason}")]
    ApplyFailed { unit: &'static str, reason: String },
    #[error("no unit registered for kind {0}")]
    UnknownKind(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("layer error: {0}")]
    Layer(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl EngineError {
    /// True for failures that leave the transport unusable.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::Io(_))
    }
}

/// Per-action signal that a precondition does not hold in the negotiated
/// context. Not an error: the executor records it and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipSignal {
    pub reason: String,
}

impl SkipSignal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for SkipSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "skipped: {}", self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failure_classification() {
        assert!(EngineError::TransportFailure("closed".into()).is_transport_failure());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(EngineError::from(io).is_transport_failure());
        let malformed = EngineError::MalformedUnit {
            unit: "ClientHello",
            field: "random",
            offset: 6,
        };
        assert!(!malformed.is_transport_failure());
        assert!(!EngineError::Crypto(CryptoError::AeadTagVerifyFail).is_transport_failure());
    }

    #[test]
    fn test_malformed_unit_message_names_field_and_offset() {
        let err = EngineError::MalformedUnit {
            unit: "ServerHello",
            field: "cipher_suite",
            offset: 39,
        };
        let text = err.to_string();
        assert!(text.contains("cipher_suite"));
        assert!(text.contains("39"));
    }

    #[test]
    fn test_skip_signal_display() {
        let skip = SkipSignal::new("no key exchange message in TLS 1.3");
        assert_eq!(skip.to_string(), "skipped: no key exchange message in TLS 1.3");
    }
}
