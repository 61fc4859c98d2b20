use tlsmith_types::{EngineError, ProtocolVersion};

use super::{HandshakeHeader, HandshakeType};
use crate::state::ConnectionState;
use crate::unit::codec::put_u16;
use crate::unit::{len_u8, Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitKind};

/// DTLS HelloVerifyRequest (RFC 6347 Section 4.2.1).
///
/// Both sides drop the first ClientHello and this message from the
/// transcript once it has been processed.
#[derive(Debug, Clone, Default)]
pub struct HelloVerifyRequest {
    pub header: HandshakeHeader,
    pub server_version: Field<u16>,
    pub cookie_length: Field<u8>,
    pub cookie: Field<Vec<u8>>,
}

impl HelloVerifyRequest {
    fn body(&self) -> Result<Vec<u8>, EngineError> {
        let cookie = self.cookie.require(Self::NAME, "cookie")?;
        let mut out = Vec::with_capacity(3 + cookie.len());
        put_u16(&mut out, self.server_version.require(Self::NAME, "server_version")?);
        out.push(self.cookie_length.require(Self::NAME, "cookie_length")?);
        out.extend_from_slice(&cookie);
        Ok(out)
    }
}

impl RegisteredUnit for HelloVerifyRequest {
    const KIND: UnitKind = HandshakeType::HELLO_VERIFY_REQUEST.kind();
    const NAME: &'static str = "HelloVerifyRequest";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = HandshakeHeader::read(r)?;
        let server_version = body.read_u16("server_version")?;
        let cookie_length = body.read_u8("cookie_length")?;
        let cookie = body.read_bytes(cookie_length as usize, "cookie")?.to_vec();
        body.expect_end()?;
        Ok(Self {
            header,
            server_version: Field::with_value(server_version),
            cookie_length: Field::with_value(cookie_length),
            cookie: Field::with_value(cookie),
        })
    }
}

impl ProtocolUnit for HelloVerifyRequest {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        // RFC 6347 recommends DTLS 1.0 here regardless of the negotiated version.
        self.server_version.fill(|| ProtocolVersion::DTLS10.0);
        self.cookie.fill(|| state.config().dtls_cookie.clone());
        let len = self.cookie.emitted_len();
        self.cookie_length.compute(|| len_u8(len));
        let body_len = self.body()?.len();
        self.header
            .compute(HandshakeType::HELLO_VERIFY_REQUEST, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received {
            let cookie = self.cookie.get();
            state.record_negotiated("dtls_cookie", |n| n.dtls_cookie = cookie);
        }
        state.transcript_mut().clear();
        Ok(())
    }

    unit_boilerplate!(registered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::Role;

    #[test]
    fn test_hello_verify_request_sets_cookie_and_clears_transcript() {
        let server = ConnectionState::new(
            EngineConfig::builder()
                .role(Role::Server)
                .supported_versions(&[ProtocolVersion::DTLS12])
                .dtls_cookie(vec![1, 2, 3])
                .build()
                .unwrap(),
        );
        let mut hvr = HelloVerifyRequest::default();
        hvr.compute_defaults(&server).unwrap();
        let bytes = hvr.encode().unwrap();
        assert_eq!(bytes, [3, 0, 0, 6, 0xFE, 0xFF, 3, 1, 2, 3]);

        let mut client = ConnectionState::new(
            EngineConfig::builder()
                .supported_versions(&[ProtocolVersion::DTLS12])
                .build()
                .unwrap(),
        );
        client.transcript_mut().append(&[1, 0, 0, 0]);
        let decoded = client
            .registry()
            .decode(HelloVerifyRequest::KIND, &bytes, &client)
            .unwrap();
        decoded.apply(&mut client, Origin::Received).unwrap();
        assert_eq!(client.negotiated().dtls_cookie, Some(vec![1, 2, 3]));
        assert!(client.transcript().is_empty());
    }
}
