use subtle::ConstantTimeEq;
use tlsmith_types::EngineError;
use tracing::{debug, warn};

use super::{HandshakeHeader, HandshakeType};
use crate::state::{ConnectionState, KeyDirection};
use crate::unit::{Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitKind};
use crate::Role;

/// TLS 1.2 verify_data length.
const TLS12_VERIFY_DATA_LEN: usize = 12;

/// Finished (RFC 8446 Section 4.4.4, RFC 5246 Section 7.4.9).
///
/// A received Finished is checked against the transcript and the result is
/// recorded as `peer_finished_valid`; a mismatch is not an error. Under
/// TLS 1.3 processing a Finished also moves the record layer to application
/// keys in the corresponding direction.
#[derive(Debug, Clone, Default)]
pub struct Finished {
    pub header: HandshakeHeader,
    pub verify_data: Field<Vec<u8>>,
}

impl RegisteredUnit for Finished {
    const KIND: UnitKind = HandshakeType::FINISHED.kind();
    const NAME: &'static str = "Finished";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = HandshakeHeader::read(r)?;
        Ok(Self {
            header,
            verify_data: Field::with_value(body.read_rest().to_vec()),
        })
    }
}

impl ProtocolUnit for Finished {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        if !self.verify_data.is_explicit() {
            let verify_data = match state.finished_verify_data(state.role(), false) {
                Ok(v) => v,
                Err(err) => {
                    let len = if state.is_tls13() {
                        state.transcript_hash_algorithm().output_len()
                    } else {
                        TLS12_VERIFY_DATA_LEN
                    };
                    debug!(error = %err, len, "no key material for Finished, using zeros");
                    vec![0; len]
                }
            };
            self.verify_data.set(verify_data);
        }
        let body_len = self.verify_data.emitted_len();
        self.header.compute(HandshakeType::FINISHED, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        let verify_data = self.verify_data.require(Self::NAME, "verify_data")?;
        self.header.write(Self::NAME, &verify_data)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        let tls13 = state.is_tls13();
        match origin {
            Origin::Received => {
                let peer = state.role().peer();
                let received = self.verify_data.get().unwrap_or_default();
                let valid = match state.finished_verify_data(peer, true) {
                    Ok(expected) => bool::from(expected.ct_eq(&received)),
                    Err(err) => {
                        debug!(error = %err, "cannot verify peer Finished");
                        false
                    }
                };
                if !valid {
                    warn!(?peer, "peer Finished does not match transcript");
                }
                state.record_negotiated("peer_finished_valid", |n| {
                    n.peer_finished_valid = Some(valid)
                });
                if tls13 {
                    if peer == Role::Server {
                        state.derive_application_secrets()?;
                    }
                    state.activate_application_keys(KeyDirection::Read)?;
                }
            }
            Origin::Sent => {
                if tls13 {
                    if state.role() == Role::Server {
                        state.derive_application_secrets()?;
                    }
                    state.activate_application_keys(KeyDirection::Write)?;
                }
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
    use crate::unit::Override;
    use tlsmith_types::ProtocolVersion;

    fn tls12(role: Role) -> ConnectionState {
        ConnectionState::new(
            EngineConfig::builder()
                .role(role)
                .supported_versions(&[ProtocolVersion::TLS12])
                .build()
                .unwrap(),
        )
    }

    fn with_master(role: Role) -> ConnectionState {
        let mut state = tls12(role);
        let config = state.config();
        let peer_random = match role {
            Role::Client => config.server_random.clone(),
            Role::Server => config.client_random.clone(),
        };
        state.record_negotiated("peer_random", |n| n.peer_random = Some(peer_random));
        state.derive_master_secret(vec![3; 32]).unwrap();
        state
    }

    #[test]
    fn test_finished_without_keys_is_zero_filled() {
        let state = tls12(Role::Client);
        let mut fin = Finished::default();
        fin.compute_defaults(&state).unwrap();
        let bytes = fin.encode().unwrap();
        assert_eq!(&bytes[..4], &[20, 0, 0, 12]);
        assert!(bytes[4..].iter().all(|b| *b == 0));

        let tls13 = ConnectionState::new(EngineConfig::default());
        let mut fin = Finished::default();
        fin.compute_defaults(&tls13).unwrap();
        assert_eq!(fin.encode().unwrap().len(), 4 + 32);
    }

    #[test]
    fn test_received_finished_is_verified() {
        let client = with_master(Role::Client);
        let mut server = with_master(Role::Server);
        server.transcript_mut().append(b"hello");
        let mut client_view = client;
        client_view.transcript_mut().append(b"hello");

        let mut fin = Finished::default();
        fin.compute_defaults(&client_view).unwrap();
        let bytes = fin.encode().unwrap();
        server.transcript_mut().append(&bytes);
        let decoded = server.registry().decode(Finished::KIND, &bytes, &server).unwrap();
        decoded.apply(&mut server, Origin::Received).unwrap();
        assert_eq!(server.negotiated().peer_finished_valid, Some(true));
    }

    #[test]
    fn test_tampered_finished_is_recorded_invalid() {
        let client = with_master(Role::Client);
        let mut server = with_master(Role::Server);
        let mut fin = Finished::default();
        fin.verify_data.set_override(Override::Xor(vec![0x01]));
        fin.compute_defaults(&client).unwrap();
        let bytes = fin.encode().unwrap();
        server.transcript_mut().append(&bytes);
        let decoded = server.registry().decode(Finished::KIND, &bytes, &server).unwrap();
        decoded.apply(&mut server, Origin::Received).unwrap();
        assert_eq!(server.negotiated().peer_finished_valid, Some(false));
    }
}
