use tlsmith_types::{EngineError, SignatureScheme};

use super::{HandshakeHeader, HandshakeType};
use crate::state::ConnectionState;
use crate::unit::codec::{put_u16, put_u24};
use crate::unit::{
    len_u16, len_u24, len_u8, Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitKind,
};

/// One certificate in a Certificate message. `extensions` exists in the
/// TLS 1.3 layout only and is kept as raw bytes.
#[derive(Debug, Clone, Default)]
pub struct CertificateEntry {
    pub cert_data_length: Field<u32>,
    pub cert_data: Field<Vec<u8>>,
    pub extensions_length: Field<u16>,
    pub extensions: Field<Vec<u8>>,
}

impl CertificateEntry {
    pub fn new(der: Vec<u8>) -> Self {
        Self {
            cert_data: Field::with_value(der),
            ..Self::default()
        }
    }

    fn compute(&mut self, tls13: bool) {
        let len = self.cert_data.emitted_len();
        self.cert_data_length.compute(|| len_u24(len));
        if tls13 {
            self.extensions.fill(Vec::new);
            let ext_len = self.extensions.emitted_len();
            self.extensions_length.compute(|| len_u16(ext_len));
        }
    }

    fn write(&self, out: &mut Vec<u8>, tls13: bool) -> Result<(), EngineError> {
        const NAME: &str = Certificate::NAME;
        put_u24(out, self.cert_data_length.require(NAME, "cert_data_length")?);
        out.extend_from_slice(&self.cert_data.require(NAME, "cert_data")?);
        if tls13 {
            put_u16(out, self.extensions_length.require(NAME, "extensions_length")?);
            out.extend_from_slice(&self.extensions.require(NAME, "extensions")?);
        }
        Ok(())
    }
}

/// Certificate in the TLS 1.3 (RFC 8446 Section 4.4.2) or TLS 1.2
/// (RFC 5246 Section 7.4.2) layout.
#[derive(Debug, Clone, Default)]
pub struct Certificate {
    pub header: HandshakeHeader,
    pub tls13: bool,
    pub request_context_length: Field<u8>,
    pub request_context: Field<Vec<u8>>,
    pub certificate_list_length: Field<u32>,
    /// `None` until compute-defaults fills the configured chain.
    pub certificates: Option<Vec<CertificateEntry>>,
}

impl Certificate {
    fn list_bytes(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::new();
        for entry in self.certificates.iter().flatten() {
            entry.write(&mut out, self.tls13)?;
        }
        Ok(out)
    }

    fn body(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::new();
        if self.tls13 {
            out.push(
                self.request_context_length
                    .require(Self::NAME, "certificate_request_context_length")?,
            );
            out.extend_from_slice(
                &self
                    .request_context
                    .require(Self::NAME, "certificate_request_context")?,
            );
        }
        put_u24(
            &mut out,
            self.certificate_list_length
                .require(Self::NAME, "certificate_list_length")?,
        );
        out.extend_from_slice(&self.list_bytes()?);
        Ok(out)
    }
}

impl RegisteredUnit for Certificate {
    const KIND: UnitKind = HandshakeType::CERTIFICATE.kind();
    const NAME: &'static str = "Certificate";

    fn decode(r: &mut Reader<'_>, state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = HandshakeHeader::read(r)?;
        let tls13 = state.is_tls13();
        let mut cert = Self {
            header,
            tls13,
            ..Self::default()
        };
        if tls13 {
            let len = body.read_u8("certificate_request_context_length")?;
            let context = body.read_bytes(len as usize, "certificate_request_context")?;
            cert.request_context_length.set(len);
            cert.request_context.set(context.to_vec());
        }
        let list_len = body.read_u24("certificate_list_length")?;
        let mut list = body.sub_reader(list_len as usize, "certificate_list")?;
        let mut entries = Vec::new();
        while !list.is_empty() {
            let len = list.read_u24("cert_data_length")?;
            let data = list.read_bytes(len as usize, "cert_data")?.to_vec();
            let mut entry = CertificateEntry {
                cert_data_length: Field::with_value(len),
                cert_data: Field::with_value(data),
                ..CertificateEntry::default()
            };
            if tls13 {
                let ext_len = list.read_u16("extensions_length")?;
                let ext = list.read_bytes(ext_len as usize, "extensions")?.to_vec();
                entry.extensions_length.set(ext_len);
                entry.extensions.set(ext);
            }
            entries.push(entry);
        }
        body.expect_end()?;
        cert.certificate_list_length.set(list_len);
        cert.certificates = Some(entries);
        Ok(cert)
    }
}

impl ProtocolUnit for Certificate {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        self.tls13 = state.is_tls13();
        if self.tls13 {
            self.request_context.fill(Vec::new);
            let len = self.request_context.emitted_len();
            self.request_context_length.compute(|| len_u8(len));
        }
        let tls13 = self.tls13;
        let entries = self.certificates.get_or_insert_with(|| {
            state
                .config()
                .certificate_chain
                .iter()
                .cloned()
                .map(CertificateEntry::new)
                .collect()
        });
        for entry in entries.iter_mut() {
            entry.compute(tls13);
        }
        let list_len = self.list_bytes()?.len();
        self.certificate_list_length.compute(|| len_u24(list_len));
        let body_len = self.body()?.len();
        self.header.compute(HandshakeType::CERTIFICATE, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received {
            let chain: Vec<Vec<u8>> = self
                .certificates
                .iter()
                .flatten()
                .filter_map(|e| e.cert_data.get())
                .collect();
            state.record_negotiated("peer_certificates", |n| n.peer_certificates = chain);
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

/// CertificateVerify (RFC 8446 Section 4.4.3). The signature is whatever
/// was set; nothing is signed.
#[derive(Debug, Clone, Default)]
pub struct CertificateVerify {
    pub header: HandshakeHeader,
    pub signature_scheme: Field<u16>,
    pub signature_length: Field<u16>,
    pub signature: Field<Vec<u8>>,
}

impl CertificateVerify {
    fn body(&self) -> Result<Vec<u8>, EngineError> {
        let signature = self.signature.require(Self::NAME, "signature")?;
        let mut out = Vec::with_capacity(4 + signature.len());
        put_u16(&mut out, self.signature_scheme.require(Self::NAME, "signature_scheme")?);
        put_u16(&mut out, self.signature_length.require(Self::NAME, "signature_length")?);
        out.extend_from_slice(&signature);
        Ok(out)
    }
}

impl RegisteredUnit for CertificateVerify {
    const KIND: UnitKind = HandshakeType::CERTIFICATE_VERIFY.kind();
    const NAME: &'static str = "CertificateVerify";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = HandshakeHeader::read(r)?;
        let scheme = body.read_u16("signature_scheme")?;
        let len = body.read_u16("signature_length")?;
        let signature = body.read_bytes(len as usize, "signature")?.to_vec();
        body.expect_end()?;
        Ok(Self {
            header,
            signature_scheme: Field::with_value(scheme),
            signature_length: Field::with_value(len),
            signature: Field::with_value(signature),
        })
    }
}

impl ProtocolUnit for CertificateVerify {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        self.signature_scheme
            .compute(|| state.selected_signature_scheme().0);
        self.signature.fill(Vec::new);
        let len = self.signature.emitted_len();
        self.signature_length.compute(|| len_u16(len));
        let body_len = self.body()?.len();
        self.header
            .compute(HandshakeType::CERTIFICATE_VERIFY, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received {
            let scheme = self.signature_scheme.get().map(SignatureScheme);
            state.record_negotiated("peer_signature_scheme", |n| {
                n.peer_signature_scheme = scheme
            });
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tlsmith_types::ProtocolVersion;

    fn tls13_state(chain: Vec<Vec<u8>>) -> ConnectionState {
        ConnectionState::new(
            EngineConfig::builder()
                .supported_versions(&[ProtocolVersion::TLS13])
                .certificate_chain(chain)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_tls13_certificate_layout() {
        let state = tls13_state(vec![vec![0x30, 0x01, 0xAA]]);
        let mut cert = Certificate::default();
        cert.compute_defaults(&state).unwrap();
        assert_eq!(
            cert.encode().unwrap(),
            [11, 0, 0, 12, 0, 0, 0, 8, 0, 0, 3, 0x30, 0x01, 0xAA, 0, 0]
        );
    }

    #[test]
    fn test_tls12_certificate_roundtrip_and_apply() {
        let mut state = ConnectionState::new(
            EngineConfig::builder()
                .supported_versions(&[ProtocolVersion::TLS12])
                .certificate_chain(vec![vec![1; 5], vec![2; 2]])
                .build()
                .unwrap(),
        );
        let mut cert = Certificate::default();
        cert.compute_defaults(&state).unwrap();
        let bytes = cert.encode().unwrap();
        assert_eq!(&bytes[4..7], &[0, 0, 13]);
        let decoded = state.registry().decode(Certificate::KIND, &bytes, &state).unwrap();
        decoded.apply(&mut state, Origin::Received).unwrap();
        assert_eq!(state.negotiated().peer_certificates, vec![vec![1; 5], vec![2; 2]]);
    }

    #[test]
    fn test_certificate_verify_uses_selected_scheme() {
        let mut state = tls13_state(vec![]);
        let mut cv = CertificateVerify::default();
        cv.signature.set(vec![9; 4]);
        cv.compute_defaults(&state).unwrap();
        let bytes = cv.encode().unwrap();
        assert_eq!(bytes, [15, 0, 0, 8, 0x08, 0x04, 0, 4, 9, 9, 9, 9]);
        let decoded = state
            .registry()
            .decode(CertificateVerify::KIND, &bytes, &state)
            .unwrap();
        decoded.apply(&mut state, Origin::Received).unwrap();
        assert_eq!(
            state.negotiated().peer_signature_scheme,
            Some(SignatureScheme::RSA_PSS_RSAE_SHA256)
        );
    }
}
