//! Default provider backed by the RustCrypto crates and x25519-dalek.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha384};
use tlsmith_types::CryptoError;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::provider::{AeadAlgorithm, CryptoProvider, HashAlgorithm};

/// Provider using software implementations from the RustCrypto project.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustCryptoProvider;

impl RustCryptoProvider {
    pub fn new() -> Self {
        Self
    }
}

fn x25519_scalar(private_key: &[u8]) -> Result<StaticSecret, CryptoError> {
    let mut bytes: [u8; 32] =
        private_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                got: private_key.len(),
            })?;
    let secret = StaticSecret::from(bytes);
    bytes.zeroize();
    Ok(secret)
}

fn seal_with<C: KeyInit + Aead>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = <C as KeyInit>::new_from_slice(key).map_err(|_| CryptoError::AeadSealFail)?;
    cipher
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AeadSealFail)
}

fn open_with<C: KeyInit + Aead>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        <C as KeyInit>::new_from_slice(key).map_err(|_| CryptoError::AeadTagVerifyFail)?;
    cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AeadTagVerifyFail)
}

fn check_key_and_nonce(alg: AeadAlgorithm, key: &[u8], nonce: &[u8]) -> Result<(), CryptoError> {
    if key.len() != alg.key_len() {
        return Err(CryptoError::InvalidKeyLength {
            expected: alg.key_len(),
            got: key.len(),
        });
    }
    if nonce.len() != alg.nonce_len() {
        return Err(CryptoError::InvalidNonceLength {
            expected: alg.nonce_len(),
            got: nonce.len(),
        });
    }
    Ok(())
}

impl CryptoProvider for RustCryptoProvider {
    fn hash(&self, alg: HashAlgorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(match alg {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
        })
    }

    fn hmac(&self, alg: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // HMAC accepts keys of any length; the error arm is unreachable in practice.
        let invalid = |_| CryptoError::InvalidKeyLength {
            expected: alg.output_len(),
            got: key.len(),
        };
        Ok(match alg {
            HashAlgorithm::Sha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(invalid)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            HashAlgorithm::Sha384 => {
                let mut mac = <Hmac<Sha384> as Mac>::new_from_slice(key).map_err(invalid)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        })
    }

    fn hkdf_extract(
        &self,
        alg: HashAlgorithm,
        salt: &[u8],
        ikm: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let salt = if salt.is_empty() { None } else { Some(salt) };
        Ok(match alg {
            HashAlgorithm::Sha256 => Hkdf::<Sha256>::extract(salt, ikm).0.to_vec(),
            HashAlgorithm::Sha384 => Hkdf::<Sha384>::extract(salt, ikm).0.to_vec(),
        })
    }

    fn hkdf_expand(
        &self,
        alg: HashAlgorithm,
        prk: &[u8],
        info: &[u8],
        length: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut okm = vec![0u8; length];
        let prk_err = |_| CryptoError::InvalidKeyLength {
            expected: alg.output_len(),
            got: prk.len(),
        };
        match alg {
            HashAlgorithm::Sha256 => Hkdf::<Sha256>::from_prk(prk)
                .map_err(prk_err)?
                .expand(info, &mut okm)
                .map_err(|_| CryptoError::KdfDkLenOverflow)?,
            HashAlgorithm::Sha384 => Hkdf::<Sha384>::from_prk(prk)
                .map_err(prk_err)?
                .expand(info, &mut okm)
                .map_err(|_| CryptoError::KdfDkLenOverflow)?,
        }
        Ok(okm)
    }

    fn aead_seal(
        &self,
        alg: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        check_key_and_nonce(alg, key, nonce)?;
        match alg {
            AeadAlgorithm::Aes128Gcm => seal_with::<Aes128Gcm>(key, nonce, aad, plaintext),
            AeadAlgorithm::Aes256Gcm => seal_with::<Aes256Gcm>(key, nonce, aad, plaintext),
            AeadAlgorithm::ChaCha20Poly1305 => {
                seal_with::<ChaCha20Poly1305>(key, nonce, aad, plaintext)
            }
        }
    }

    fn aead_open(
        &self,
        alg: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        check_key_and_nonce(alg, key, nonce)?;
        match alg {
            AeadAlgorithm::Aes128Gcm => open_with::<Aes128Gcm>(key, nonce, aad, ciphertext),
            AeadAlgorithm::Aes256Gcm => open_with::<Aes256Gcm>(key, nonce, aad, ciphertext),
            AeadAlgorithm::ChaCha20Poly1305 => {
                open_with::<ChaCha20Poly1305>(key, nonce, aad, ciphertext)
            }
        }
    }

    fn x25519_public_key(&self, private_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let secret = x25519_scalar(private_key)?;
        Ok(PublicKey::from(&secret).as_bytes().to_vec())
    }

    fn x25519_agree(
        &self,
        private_key: &[u8],
        peer_public: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let secret = x25519_scalar(private_key)?;
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let shared = secret.diffie_hellman(&PublicKey::from(peer));
        Ok(shared.as_bytes().to_vec())
    }

    fn random_bytes(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        OsRng
            .try_fill_bytes(out)
            .map_err(|_| CryptoError::RandomFail)
    }
}
