//! TLS 1.3 HKDF label helpers (RFC 8446 Section 7.1).

use crate::provider::{CryptoProvider, HashAlgorithm};
use tlsmith_types::CryptoError;

/// Encode the HkdfLabel structure:
///
/// ```text
/// struct {
///     uint16 length;
///     opaque label<7..255>;   // "tls13 " + label
///     opaque context<0..255>;
/// } HkdfLabel;
/// ```
pub fn encode_hkdf_label(length: u16, label: &[u8], context: &[u8]) -> Vec<u8> {
    let full_label_len = 6 + label.len();
    let mut buf = Vec::with_capacity(2 + 1 + full_label_len + 1 + context.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.push(full_label_len as u8);
    buf.extend_from_slice(b"tls13 ");
    buf.extend_from_slice(label);
    buf.push(context.len() as u8);
    buf.extend_from_slice(context);
    buf
}

/// HKDF-Expand-Label(Secret, Label, Context, Length).
pub fn hkdf_expand_label(
    provider: &dyn CryptoProvider,
    alg: HashAlgorithm,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    length: usize,
) -> Result<Vec<u8>, CryptoError> {
    let length_u16 = u16::try_from(length).map_err(|_| CryptoError::KdfDkLenOverflow)?;
    let info = encode_hkdf_label(length_u16, label, context);
    provider.hkdf_expand(alg, secret, &info, length)
}

/// Derive-Secret(Secret, Label, Messages) with an already computed
/// transcript hash.
pub fn derive_secret(
    provider: &dyn CryptoProvider,
    alg: HashAlgorithm,
    secret: &[u8],
    label: &[u8],
    transcript_hash: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    hkdf_expand_label(
        provider,
        alg,
        secret,
        label,
        transcript_hash,
        alg.output_len(),
    )
}
