use tlsmith_types::{EngineError, ProtocolVersion};

use super::{ExtensionHeader, ExtensionType, HelloContext};
use crate::state::ConnectionState;
use crate::unit::codec::put_u16;
use crate::unit::{len_u8, Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitKind};
use crate::Role;

/// Body layout of supported_versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionsForm {
    /// ClientHello: u8-length list of versions.
    List,
    /// ServerHello / HelloRetryRequest: the single selected version.
    Selected,
}

/// supported_versions (RFC 8446 Section 4.2.1).
#[derive(Debug, Clone, Default)]
pub struct SupportedVersions {
    pub header: ExtensionHeader,
    /// Set by the carrying message; compute-defaults falls back to the
    /// local role when a standalone extension leaves it unset.
    pub form: Option<VersionsForm>,
    pub list_length: Field<u8>,
    pub versions: Field<Vec<u16>>,
    pub selected: Field<u16>,
}

impl SupportedVersions {
    /// ClientHello form; versions come from configuration.
    pub fn list() -> Self {
        Self {
            form: Some(VersionsForm::List),
            ..Self::default()
        }
    }

    pub fn selected(version: ProtocolVersion) -> Self {
        let mut ext = Self {
            form: Some(VersionsForm::Selected),
            ..Self::default()
        };
        ext.selected.set(version.0);
        ext
    }

    fn body(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::new();
        match self.form.unwrap_or(VersionsForm::List) {
            VersionsForm::List => {
                out.push(self.list_length.require(Self::NAME, "list_length")?);
                for v in self.versions.require(Self::NAME, "versions")? {
                    put_u16(&mut out, v);
                }
            }
            VersionsForm::Selected => {
                put_u16(&mut out, self.selected.require(Self::NAME, "selected_version")?);
            }
        }
        Ok(out)
    }
}

impl RegisteredUnit for SupportedVersions {
    const KIND: UnitKind = ExtensionType::SUPPORTED_VERSIONS.kind();
    const NAME: &'static str = "SupportedVersions";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let context = HelloContext::of(r);
        let (header, mut body) = ExtensionHeader::read(r)?;
        let selected_form = match context {
            HelloContext::ServerHello => true,
            HelloContext::ClientHello | HelloContext::EncryptedExtensions => false,
            HelloContext::Other => body.remaining() == 2,
        };
        let mut ext = Self {
            header,
            ..Self::default()
        };
        if selected_form {
            ext.form = Some(VersionsForm::Selected);
            ext.selected.set(body.read_u16("selected_version")?);
        } else {
            ext.form = Some(VersionsForm::List);
            let list_length = body.read_u8("list_length")?;
            let mut list = body.sub_reader(list_length as usize, "versions")?;
            let mut versions = Vec::with_capacity(list_length as usize / 2);
            while !list.is_empty() {
                versions.push(list.read_u16("version")?);
            }
            ext.list_length.set(list_length);
            ext.versions.set(versions);
        }
        body.expect_end()?;
        Ok(ext)
    }
}

impl ProtocolUnit for SupportedVersions {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        let form = *self.form.get_or_insert(match state.role() {
            Role::Client => VersionsForm::List,
            Role::Server => VersionsForm::Selected,
        });
        match form {
            VersionsForm::List => {
                self.versions.fill(|| {
                    state
                        .config()
                        .supported_versions
                        .iter()
                        .map(|v| v.0)
                        .collect()
                });
                let count = self.versions.emitted_len();
                self.list_length.compute(|| len_u8(count * 2));
            }
            VersionsForm::Selected => {
                self.selected.compute(|| state.selected_version().0);
            }
        }
        let body_len = self.body()?.len();
        self.header.compute(ExtensionType::SUPPORTED_VERSIONS, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Sent {
            return Ok(());
        }
        match self.form {
            Some(VersionsForm::Selected) => {
                let version = self.selected.get().map(ProtocolVersion);
                state.record_negotiated("version", |n| n.version = version);
            }
            _ => {
                let versions: Vec<ProtocolVersion> = self
                    .versions
                    .get()
                    .unwrap_or_default()
                    .into_iter()
                    .map(ProtocolVersion)
                    .collect();
                state.record_negotiated("peer_versions", |n| n.peer_versions = versions);
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
    use crate::handshake::HandshakeType;

    #[test]
    fn test_client_list_form() {
        let state = ConnectionState::new(EngineConfig::default());
        let mut ext = SupportedVersions::default();
        ext.compute_defaults(&state).unwrap();
        assert_eq!(ext.encode().unwrap(), [0, 43, 0, 5, 4, 3, 4, 3, 3]);
    }

    #[test]
    fn test_server_form_chosen_by_parent() {
        let mut state = ConnectionState::new(EngineConfig::default());
        let bytes = [0, 43, 0, 2, 3, 4];
        let ext = state
            .registry()
            .decode_nested(
                SupportedVersions::KIND,
                &bytes,
                HandshakeType::SERVER_HELLO.kind(),
                &state,
            )
            .unwrap();
        ext.apply(&mut state, Origin::Received).unwrap();
        assert_eq!(state.negotiated().version, Some(ProtocolVersion::TLS13));
        assert!(state.is_tls13());
    }

    #[test]
    fn test_standalone_decode_infers_form() {
        let state = ConnectionState::new(EngineConfig::default());
        let registry = state.registry();
        let selected = registry
            .decode(SupportedVersions::KIND, &[0, 43, 0, 2, 3, 4], &state)
            .unwrap();
        let selected = selected.downcast_ref::<SupportedVersions>().unwrap();
        assert_eq!(selected.form, Some(VersionsForm::Selected));
        assert_eq!(selected.selected.get(), Some(0x0304));
        let list = registry
            .decode(SupportedVersions::KIND, &[0, 43, 0, 3, 2, 3, 4], &state)
            .unwrap();
        assert_eq!(
            list.downcast_ref::<SupportedVersions>().unwrap().form,
            Some(VersionsForm::List)
        );
    }

    #[test]
    fn test_server_applies_client_list() {
        let mut state =
            ConnectionState::new(EngineConfig::builder().role(Role::Server).build().unwrap());
        let bytes = [0, 43, 0, 3, 2, 3, 3];
        let ext = state
            .registry()
            .decode_nested(
                SupportedVersions::KIND,
                &bytes,
                HandshakeType::CLIENT_HELLO.kind(),
                &state,
            )
            .unwrap();
        ext.apply(&mut state, Origin::Received).unwrap();
        assert_eq!(state.negotiated().peer_versions, vec![ProtocolVersion::TLS12]);
        assert_eq!(state.selected_version(), ProtocolVersion::TLS12);
    }
}
