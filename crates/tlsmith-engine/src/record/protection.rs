//! TLS 1.3 record protection (RFC 8446 Section 5.2).
//!
//! ```text
//! TLSInnerPlaintext = content || ContentType || zeros[padding]
//! nonce             = iv XOR (0^(iv_len-8) || sequence_number)
//! additional_data   = opaque_type(23) || legacy_record_version || length
//! ```

use tlsmith_crypto::{AeadAlgorithm, CipherSuiteParams, CryptoProvider};
use tlsmith_types::EngineError;
use zeroize::Zeroize;

use super::ContentType;
use crate::state::TrafficKeys;

/// AEAD state for one direction.
pub struct RecordCipher {
    aead: AeadAlgorithm,
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl Drop for RecordCipher {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

impl std::fmt::Debug for RecordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCipher")
            .field("aead", &self.aead)
            .finish_non_exhaustive()
    }
}

impl RecordCipher {
    pub fn new(aead: AeadAlgorithm, keys: &TrafficKeys) -> Self {
        Self {
            aead,
            key: keys.key.clone(),
            iv: keys.iv.clone(),
        }
    }

    /// Expand a traffic secret into key and IV.
    pub fn from_secret(
        crypto: &dyn CryptoProvider,
        params: &CipherSuiteParams,
        traffic_secret: &[u8],
    ) -> Result<Self, EngineError> {
        let keys = TrafficKeys::derive(crypto, params, traffic_secret)?;
        Ok(Self::new(params.aead, &keys))
    }

    pub fn tag_len(&self) -> usize {
        self.aead.tag_len()
    }

    fn nonce(&self, sequence: u64) -> Vec<u8> {
        let mut nonce = self.iv.clone();
        let offset = nonce.len().saturating_sub(8);
        for (n, s) in nonce[offset..].iter_mut().zip(sequence.to_be_bytes()) {
            *n ^= s;
        }
        nonce
    }

    fn additional_data(ciphertext_len: usize) -> [u8; 5] {
        let len = (ciphertext_len as u16).to_be_bytes();
        [ContentType::APPLICATION_DATA.0, 0x03, 0x03, len[0], len[1]]
    }

    /// Protect `plaintext` of `content_type`; returns the record payload.
    pub fn seal(
        &self,
        crypto: &dyn CryptoProvider,
        sequence: u64,
        content_type: ContentType,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let mut inner = Vec::with_capacity(plaintext.len() + 1);
        inner.extend_from_slice(plaintext);
        inner.push(content_type.0);
        let aad = Self::additional_data(inner.len() + self.tag_len());
        Ok(crypto.aead_seal(self.aead, &self.key, &self.nonce(sequence), &aad, &inner)?)
    }

    /// Remove protection; returns the inner content type and plaintext.
    pub fn open(
        &self,
        crypto: &dyn CryptoProvider,
        sequence: u64,
        ciphertext: &[u8],
    ) -> Result<(ContentType, Vec<u8>), EngineError> {
        let aad = Self::additional_data(ciphertext.len());
        let mut inner = crypto.aead_open(self.aead, &self.key, &self.nonce(sequence), &aad, ciphertext)?;
        while inner.last() == Some(&0) {
            inner.pop();
        }
        let content_type = inner.pop().ok_or(EngineError::MalformedUnit {
            unit: "Record",
            field: "inner content type",
            offset: 0,
        })?;
        Ok((ContentType(content_type), inner))
    }
}
