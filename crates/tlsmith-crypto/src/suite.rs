//! Primitive parameters for TLS 1.3 cipher suites.

use crate::provider::{AeadAlgorithm, HashAlgorithm};
use tlsmith_types::CipherSuite;

/// Hash and AEAD selected by a TLS 1.3 cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuiteParams {
    pub suite: CipherSuite,
    pub hash: HashAlgorithm,
    pub aead: AeadAlgorithm,
}

impl CipherSuiteParams {
    /// Parameters for a TLS 1.3 suite, `None` for anything else.
    pub fn from_suite(suite: CipherSuite) -> Option<Self> {
        let (hash, aead) = match suite {
            CipherSuite::TLS_AES_128_GCM_SHA256 => (HashAlgorithm::Sha256, AeadAlgorithm::Aes128Gcm),
            CipherSuite::TLS_AES_256_GCM_SHA384 => (HashAlgorithm::Sha384, AeadAlgorithm::Aes256Gcm),
            CipherSuite::TLS_CHACHA20_POLY1305_SHA256 => {
                (HashAlgorithm::Sha256, AeadAlgorithm::ChaCha20Poly1305)
            }
            _ => return None,
        };
        Some(Self { suite, hash, aead })
    }

    pub fn hash_len(&self) -> usize {
        self.hash.output_len()
    }

    pub fn key_len(&self) -> usize {
        self.aead.key_len()
    }

    pub fn iv_len(&self) -> usize {
        self.aead.nonce_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls13_suites() {
        let p = CipherSuiteParams::from_suite(CipherSuite::TLS_AES_256_GCM_SHA384).unwrap();
        assert_eq!(p.hash_len(), 48);
        assert_eq!(p.key_len(), 32);
        assert_eq!(p.iv_len(), 12);

        let p = CipherSuiteParams::from_suite(CipherSuite::TLS_CHACHA20_POLY1305_SHA256).unwrap();
        assert_eq!(p.aead, AeadAlgorithm::ChaCha20Poly1305);
        assert_eq!(p.hash_len(), 32);
    }

    #[test]
    fn test_tls12_suite_has_no_tls13_params() {
        assert!(
            CipherSuiteParams::from_suite(CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256)
                .is_none()
        );
    }
}
