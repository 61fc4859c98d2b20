//! Handshake transcript.
//!
//! Keeps every handshake message (TLS 4-byte header form) with its boundary,
//! and replays the buffer through the provider whenever a hash is needed, so
//! the hash algorithm can be chosen after the fact.

use tlsmith_crypto::{CryptoProvider, HashAlgorithm};
use tlsmith_types::EngineError;

/// `HandshakeType::message_hash` (RFC 8446 Section 4.4.1).
const MESSAGE_HASH: u8 = 254;

/// Ordered handshake messages fed into transcript hashes.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Vec<u8>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    /// Append one complete handshake message.
    pub fn append(&mut self, message: &[u8]) {
        self.messages.push(message.to_vec());
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Vec<u8>] {
        &self.messages
    }

    /// Concatenation of all messages.
    pub fn bytes(&self) -> Vec<u8> {
        self.messages.concat()
    }

    /// Hash over all messages.
    pub fn hash(
        &self,
        crypto: &dyn CryptoProvider,
        alg: HashAlgorithm,
    ) -> Result<Vec<u8>, EngineError> {
        Ok(crypto.hash(alg, &self.bytes())?)
    }

    /// Hash over all messages but the most recent one.
    pub fn hash_without_last(
        &self,
        crypto: &dyn CryptoProvider,
        alg: HashAlgorithm,
    ) -> Result<Vec<u8>, EngineError> {
        let end = self.messages.len().saturating_sub(1);
        Ok(crypto.hash(alg, &self.messages[..end].concat())?)
    }

    /// Replace everything before the most recent message with the synthetic
    /// `message_hash` construct. Applied when a HelloRetryRequest arrives.
    pub fn replace_with_message_hash(
        &mut self,
        crypto: &dyn CryptoProvider,
        alg: HashAlgorithm,
    ) -> Result<(), EngineError> {
        let Some(last) = self.messages.pop() else {
            return Ok(());
        };
        let hash = crypto.hash(alg, &self.bytes())?;
        let mut synthetic = Vec::with_capacity(4 + hash.len());
        synthetic.push(MESSAGE_HASH);
        synthetic.push(0);
        synthetic.push(0);
        synthetic.push(hash.len() as u8);
        synthetic.extend_from_slice(&hash);
        self.messages = vec![synthetic, last];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlsmith_crypto::RustCryptoProvider;

    #[test]
    fn test_hash_without_last_excludes_latest_message() {
        let crypto = RustCryptoProvider::new();
        let mut t = Transcript::new();
        t.append(b"first");
        let only_first = t.hash(&crypto, HashAlgorithm::Sha256).unwrap();
        t.append(b"second");
        assert_eq!(
            t.hash_without_last(&crypto, HashAlgorithm::Sha256).unwrap(),
            only_first
        );
        assert_eq!(
            t.hash(&crypto, HashAlgorithm::Sha256).unwrap(),
            crypto.hash(HashAlgorithm::Sha256, b"firstsecond").unwrap()
        );
    }

    #[test]
    fn test_replace_with_message_hash() {
        let crypto = RustCryptoProvider::new();
        let mut t = Transcript::new();
        t.append(b"client hello 1");
        t.append(b"hello retry");
        t.replace_with_message_hash(&crypto, HashAlgorithm::Sha256)
            .unwrap();
        assert_eq!(t.len(), 2);
        let synthetic = &t.messages()[0];
        assert_eq!(&synthetic[..4], &[254, 0, 0, 32]);
        assert_eq!(
            &synthetic[4..],
            crypto
                .hash(HashAlgorithm::Sha256, b"client hello 1")
                .unwrap()
                .as_slice()
        );
        assert_eq!(t.messages()[1], b"hello retry");
    }

    #[test]
    fn test_empty_transcript_hash_is_hash_of_nothing() {
        let crypto = RustCryptoProvider::new();
        let t = Transcript::new();
        assert_eq!(
            t.hash_without_last(&crypto, HashAlgorithm::Sha384).unwrap(),
            crypto.hash(HashAlgorithm::Sha384, b"").unwrap()
        );
    }
}
