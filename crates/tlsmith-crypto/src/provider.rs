//! Functional interface to the primitives the engine calls out to.
//!
//! Every operation is a pure function from inputs to output or failure; the
//! engine never holds primitive state across calls, so a provider can be
//! swapped (for instruments, faulty implementations, hardware) without the
//! engine noticing.

use tlsmith_types::CryptoError;

/// Hash functions used by the TLS 1.3 key schedule and transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
        }
    }
}

/// AEAD ciphers for record protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AeadAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 32,
        }
    }

    pub fn nonce_len(self) -> usize {
        12
    }

    pub fn tag_len(self) -> usize {
        16
    }
}

/// Primitive operations consumed by compute-defaults and apply-to-state.
pub trait CryptoProvider: Send + Sync {
    /// One-shot digest.
    fn hash(&self, alg: HashAlgorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// `HMAC-Hash(key, data)`.
    fn hmac(&self, alg: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// `HKDF-Extract(salt, ikm)`; an empty salt means `Hash.length` zero bytes.
    fn hkdf_extract(
        &self,
        alg: HashAlgorithm,
        salt: &[u8],
        ikm: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// `HKDF-Expand(prk, info, length)`.
    fn hkdf_expand(
        &self,
        alg: HashAlgorithm,
        prk: &[u8],
        info: &[u8],
        length: usize,
    ) -> Result<Vec<u8>, CryptoError>;

    /// AEAD encryption. Returns `ciphertext || tag`.
    fn aead_seal(
        &self,
        alg: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// AEAD decryption of `ciphertext || tag`.
    fn aead_open(
        &self,
        alg: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// X25519 public key for a 32-byte private scalar.
    fn x25519_public_key(&self, private_key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// X25519 shared secret between a private scalar and a peer public key.
    fn x25519_agree(&self, private_key: &[u8], peer_public: &[u8])
        -> Result<Vec<u8>, CryptoError>;

    /// Fill `out` with random bytes.
    fn random_bytes(&self, out: &mut [u8]) -> Result<(), CryptoError>;
}
