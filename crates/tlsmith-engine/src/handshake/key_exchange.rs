//! TLS 1.2 ECDHE key exchange messages (RFC 8422 Section 5.4, 5.7).

use tlsmith_types::{EngineError, NamedGroup};

use super::{HandshakeHeader, HandshakeType};
use crate::state::ConnectionState;
use crate::unit::codec::put_u16;
use crate::unit::{len_u16, len_u8, Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitKind};

/// ECCurveType.named_curve.
pub const CURVE_TYPE_NAMED_CURVE: u8 = 3;

/// ServerKeyExchange with ECDHE parameters. The signature is carried as set;
/// nothing is signed.
#[derive(Debug, Clone, Default)]
pub struct ServerKeyExchange {
    pub header: HandshakeHeader,
    pub curve_type: Field<u8>,
    pub named_curve: Field<u16>,
    pub public_length: Field<u8>,
    pub public_key: Field<Vec<u8>>,
    pub signature_scheme: Field<u16>,
    pub signature_length: Field<u16>,
    pub signature: Field<Vec<u8>>,
}

impl ServerKeyExchange {
    fn body(&self) -> Result<Vec<u8>, EngineError> {
        const NAME: &str = ServerKeyExchange::NAME;
        let mut out = Vec::with_capacity(80);
        out.push(self.curve_type.require(NAME, "curve_type")?);
        put_u16(&mut out, self.named_curve.require(NAME, "named_curve")?);
        out.push(self.public_length.require(NAME, "public_length")?);
        out.extend_from_slice(&self.public_key.require(NAME, "public_key")?);
        put_u16(&mut out, self.signature_scheme.require(NAME, "signature_scheme")?);
        put_u16(&mut out, self.signature_length.require(NAME, "signature_length")?);
        out.extend_from_slice(&self.signature.require(NAME, "signature")?);
        Ok(out)
    }
}

impl RegisteredUnit for ServerKeyExchange {
    const KIND: UnitKind = HandshakeType::SERVER_KEY_EXCHANGE.kind();
    const NAME: &'static str = "ServerKeyExchange";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = HandshakeHeader::read(r)?;
        let curve_type = body.read_u8("curve_type")?;
        let named_curve = body.read_u16("named_curve")?;
        let public_length = body.read_u8("public_length")?;
        let public_key = body.read_bytes(public_length as usize, "public_key")?.to_vec();
        let signature_scheme = body.read_u16("signature_scheme")?;
        let signature_length = body.read_u16("signature_length")?;
        let signature = body
            .read_bytes(signature_length as usize, "signature")?
            .to_vec();
        body.expect_end()?;
        Ok(Self {
            header,
            curve_type: Field::with_value(curve_type),
            named_curve: Field::with_value(named_curve),
            public_length: Field::with_value(public_length),
            public_key: Field::with_value(public_key),
            signature_scheme: Field::with_value(signature_scheme),
            signature_length: Field::with_value(signature_length),
            signature: Field::with_value(signature),
        })
    }
}

impl ProtocolUnit for ServerKeyExchange {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        self.curve_type.fill(|| CURVE_TYPE_NAMED_CURVE);
        self.named_curve.compute(|| state.selected_group().0);
        let group = NamedGroup(self.named_curve.require(Self::NAME, "named_curve")?);
        if self.public_key.value().is_none() {
            self.public_key
                .try_compute(|| state.key_share_public_for(group))?;
        }
        let public_len = self.public_key.emitted_len();
        self.public_length.compute(|| len_u8(public_len));
        self.signature_scheme
            .compute(|| state.selected_signature_scheme().0);
        self.signature.fill(Vec::new);
        let signature_len = self.signature.emitted_len();
        self.signature_length.compute(|| len_u16(signature_len));
        let body_len = self.body()?.len();
        self.header
            .compute(HandshakeType::SERVER_KEY_EXCHANGE, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        let group = self.named_curve.get().map(NamedGroup);
        match origin {
            Origin::Received => {
                let key = self.public_key.get();
                state.record_negotiated("peer_key_share", |n| {
                    n.named_group = group;
                    n.peer_key_share_group = group;
                    n.peer_key_share = key;
                });
            }
            Origin::Sent => state.record_local("named_group", |l| l.named_group = group),
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

/// ServerHelloDone: an empty body.
#[derive(Debug, Clone, Default)]
pub struct ServerHelloDone {
    pub header: HandshakeHeader,
}

impl RegisteredUnit for ServerHelloDone {
    const KIND: UnitKind = HandshakeType::SERVER_HELLO_DONE.kind();
    const NAME: &'static str = "ServerHelloDone";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, body) = HandshakeHeader::read(r)?;
        body.expect_end()?;
        Ok(Self { header })
    }
}

impl ProtocolUnit for ServerHelloDone {
    fn compute_defaults(&mut self, _state: &ConnectionState) -> Result<(), EngineError> {
        self.header.compute(HandshakeType::SERVER_HELLO_DONE, 0);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &[])
    }

    fn apply(&self, _state: &mut ConnectionState, _origin: Origin) -> Result<(), EngineError> {
        Ok(())
    }

    unit_boilerplate!(registered);
}

/// ClientKeyExchange carrying the client's ECDHE public point. Applying it
/// on either side derives the TLS 1.2 master secret.
#[derive(Debug, Clone, Default)]
pub struct ClientKeyExchange {
    pub header: HandshakeHeader,
    pub public_length: Field<u8>,
    pub public_key: Field<Vec<u8>>,
}

impl ClientKeyExchange {
    fn body(&self) -> Result<Vec<u8>, EngineError> {
        let key = self.public_key.require(Self::NAME, "public_key")?;
        let mut out = Vec::with_capacity(1 + key.len());
        out.push(self.public_length.require(Self::NAME, "public_length")?);
        out.extend_from_slice(&key);
        Ok(out)
    }
}

impl RegisteredUnit for ClientKeyExchange {
    const KIND: UnitKind = HandshakeType::CLIENT_KEY_EXCHANGE.kind();
    const NAME: &'static str = "ClientKeyExchange";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = HandshakeHeader::read(r)?;
        let len = body.read_u8("public_length")?;
        let key = body.read_bytes(len as usize, "public_key")?.to_vec();
        body.expect_end()?;
        Ok(Self {
            header,
            public_length: Field::with_value(len),
            public_key: Field::with_value(key),
        })
    }
}

impl ProtocolUnit for ClientKeyExchange {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        if self.public_key.value().is_none() {
            self.public_key
                .try_compute(|| state.local_key_share_public())?;
        }
        let len = self.public_key.emitted_len();
        self.public_length.compute(|| len_u8(len));
        let body_len = self.body()?.len();
        self.header
            .compute(HandshakeType::CLIENT_KEY_EXCHANGE, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received {
            let key = self.public_key.get();
            state.record_negotiated("peer_key_share", |n| n.peer_key_share = key);
        }
        let pre_master = state.shared_secret()?;
        state.derive_master_secret(pre_master)
    }

    unit_boilerplate!(registered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::Role;
    use tlsmith_types::{CipherSuite, ProtocolVersion};

    fn config(role: Role) -> EngineConfig {
        EngineConfig::builder()
            .role(role)
            .supported_versions(&[ProtocolVersion::TLS12])
            .cipher_suites(&[CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256])
            .build()
            .unwrap()
    }

    #[test]
    fn test_ecdhe_exchange_agrees_on_master_secret() {
        let mut server = ConnectionState::new(config(Role::Server));
        let mut client = ConnectionState::new(config(Role::Client));
        let client_random = client.config().client_random.clone();
        let server_random = server.config().server_random.clone();
        server.record_negotiated("peer_random", |n| n.peer_random = Some(client_random));
        client.record_negotiated("peer_random", |n| n.peer_random = Some(server_random));

        let mut ske = ServerKeyExchange::default();
        ske.compute_defaults(&server).unwrap();
        ske.apply(&mut server, Origin::Sent).unwrap();
        let ske_bytes = ske.encode().unwrap();
        assert_eq!(&ske_bytes[4..8], &[3, 0x00, 0x1d, 32]);
        let received = client
            .registry()
            .decode(ServerKeyExchange::KIND, &ske_bytes, &client)
            .unwrap();
        received.apply(&mut client, Origin::Received).unwrap();

        let mut cke = ClientKeyExchange::default();
        cke.compute_defaults(&client).unwrap();
        cke.apply(&mut client, Origin::Sent).unwrap();
        let cke_bytes = cke.encode().unwrap();
        let received = server
            .registry()
            .decode(ClientKeyExchange::KIND, &cke_bytes, &server)
            .unwrap();
        received.apply(&mut server, Origin::Received).unwrap();

        assert_eq!(client.keys().master_secret().len(), 48);
        assert_eq!(client.keys().master_secret(), server.keys().master_secret());
    }

    #[test]
    fn test_server_hello_done_rejects_body() {
        let state = ConnectionState::new(config(Role::Client));
        let mut done = ServerHelloDone::default();
        done.compute_defaults(&state).unwrap();
        assert_eq!(done.encode().unwrap(), [14, 0, 0, 0]);
        assert!(state
            .registry()
            .decode(ServerHelloDone::KIND, &[14, 0, 0, 1, 0], &state)
            .is_err());
    }

    #[test]
    fn test_client_key_exchange_without_peer_share_fails_apply() {
        let mut client = ConnectionState::new(config(Role::Client));
        let mut cke = ClientKeyExchange::default();
        cke.compute_defaults(&client).unwrap();
        assert!(cke.apply(&mut client, Origin::Sent).is_err());
    }
}
