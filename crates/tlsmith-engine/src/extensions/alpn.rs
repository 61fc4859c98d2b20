use tlsmith_types::EngineError;

use super::{ExtensionHeader, ExtensionType};
use crate::state::ConnectionState;
use crate::unit::codec::put_u16;
use crate::unit::{len_u16, Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitKind};
use crate::Role;

/// application_layer_protocol_negotiation (RFC 7301). A client offers a
/// list; a server answers with a single-entry list.
#[derive(Debug, Clone, Default)]
pub struct Alpn {
    pub header: ExtensionHeader,
    pub list_length: Field<u16>,
    /// Protocol names; `None` until compute-defaults or decode sets them.
    pub protocols: Option<Vec<Vec<u8>>>,
}

impl Alpn {
    pub fn with_protocols(protocols: &[&[u8]]) -> Self {
        Self {
            protocols: Some(protocols.iter().map(|p| p.to_vec()).collect()),
            ..Self::default()
        }
    }

    pub fn offer(protocols: &[Vec<u8>]) -> Self {
        Self {
            protocols: Some(protocols.to_vec()),
            ..Self::default()
        }
    }

    fn list_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for p in self.protocols.iter().flatten() {
            out.push(p.len() as u8);
            out.extend_from_slice(p);
        }
        out
    }

    fn body(&self) -> Result<Vec<u8>, EngineError> {
        let list = self.list_bytes();
        let mut out = Vec::with_capacity(2 + list.len());
        put_u16(&mut out, self.list_length.require(Self::NAME, "list_length")?);
        out.extend_from_slice(&list);
        Ok(out)
    }
}

impl RegisteredUnit for Alpn {
    const KIND: UnitKind = ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION.kind();
    const NAME: &'static str = "Alpn";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = ExtensionHeader::read(r)?;
        let list_length = body.read_u16("list_length")?;
        let mut list = body.sub_reader(list_length as usize, "protocol_name_list")?;
        let mut protocols = Vec::new();
        while !list.is_empty() {
            let len = list.read_u8("protocol_name_length")?;
            protocols.push(list.read_bytes(len as usize, "protocol_name")?.to_vec());
        }
        body.expect_end()?;
        Ok(Self {
            header,
            list_length: Field::with_value(list_length),
            protocols: Some(protocols),
        })
    }
}

impl ProtocolUnit for Alpn {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        if self.protocols.is_none() {
            self.protocols = Some(match state.role() {
                Role::Client => state.config().alpn_protocols.clone(),
                Role::Server => state.selected_alpn().into_iter().collect(),
            });
        }
        let list_len = self.list_bytes().len();
        self.list_length.compute(|| len_u16(list_len));
        let body_len = self.body()?.len();
        self.header
            .compute(ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Sent {
            return Ok(());
        }
        let protocols = self.protocols.clone().unwrap_or_default();
        match state.role() {
            Role::Server => {
                state.record_negotiated("peer_alpn_protocols", |n| {
                    n.peer_alpn_protocols = protocols
                });
            }
            Role::Client => {
                let selected = protocols.into_iter().next();
                state.record_negotiated("alpn_protocol", |n| n.alpn_protocol = selected);
            }
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn test_client_offer_encoding() {
        let state = ConnectionState::new(
            EngineConfig::builder()
                .alpn(&[b"h2", b"http/1.1"])
                .build()
                .unwrap(),
        );
        let mut ext = Alpn::default();
        ext.compute_defaults(&state).unwrap();
        assert_eq!(
            hex::encode(ext.encode().unwrap()),
            "0010000e000c02683208687474702f312e31"
        );
    }

    #[test]
    fn test_server_selects_first_configured_offered_protocol() {
        let mut state = ConnectionState::new(
            EngineConfig::builder()
                .role(Role::Server)
                .alpn(&[b"http/1.1", b"h2"])
                .build()
                .unwrap(),
        );
        let offer = hex::decode("0010000e000c02683208687474702f312e31").unwrap();
        let ext = state.registry().decode(Alpn::KIND, &offer, &state).unwrap();
        ext.apply(&mut state, Origin::Received).unwrap();
        assert_eq!(state.negotiated().peer_alpn_protocols.len(), 2);

        let mut answer = Alpn::default();
        answer.compute_defaults(&state).unwrap();
        assert_eq!(answer.protocols, Some(vec![b"http/1.1".to_vec()]));
    }

    #[test]
    fn test_client_records_selected_protocol() {
        let mut state = ConnectionState::new(EngineConfig::default());
        let ext = Alpn::with_protocols(&[b"h2"]);
        ext.apply(&mut state, Origin::Received).unwrap();
        assert_eq!(state.negotiated().alpn_protocol.as_deref(), Some(&b"h2"[..]));
    }
}
