use tlsmith_types::EngineError;

use super::{ExtensionHeader, ExtensionType};
use crate::state::ConnectionState;
use crate::unit::codec::put_u16;
use crate::unit::{len_u16, Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitKind};
use crate::Role;

/// server_name (RFC 6066 Section 3). A client sends one host_name entry; a
/// server acknowledges with an empty body.
#[derive(Debug, Clone, Default)]
pub struct ServerName {
    pub header: ExtensionHeader,
    /// Empty-bodied server acknowledgement.
    pub acknowledgement: bool,
    pub list_length: Field<u16>,
    pub name_type: Field<u8>,
    pub name_length: Field<u16>,
    pub host_name: Field<Vec<u8>>,
}

impl ServerName {
    pub fn host(name: &str) -> Self {
        let mut ext = Self::default();
        ext.host_name.set(name.as_bytes().to_vec());
        ext
    }

    /// The empty-bodied form a server answers with.
    pub fn acknowledgement() -> Self {
        Self {
            acknowledgement: true,
            ..Self::default()
        }
    }

    fn body(&self) -> Result<Vec<u8>, EngineError> {
        if self.acknowledgement {
            return Ok(Vec::new());
        }
        let host = self.host_name.require(Self::NAME, "host_name")?;
        let mut out = Vec::with_capacity(5 + host.len());
        put_u16(&mut out, self.list_length.require(Self::NAME, "list_length")?);
        out.push(self.name_type.require(Self::NAME, "name_type")?);
        put_u16(&mut out, self.name_length.require(Self::NAME, "name_length")?);
        out.extend_from_slice(&host);
        Ok(out)
    }
}

impl RegisteredUnit for ServerName {
    const KIND: UnitKind = ExtensionType::SERVER_NAME.kind();
    const NAME: &'static str = "ServerName";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = ExtensionHeader::read(r)?;
        if body.is_empty() {
            return Ok(Self {
                header,
                acknowledgement: true,
                ..Self::default()
            });
        }
        let list_length = body.read_u16("list_length")?;
        let mut list = body.sub_reader(list_length as usize, "server_name_list")?;
        let name_type = list.read_u8("name_type")?;
        let name_length = list.read_u16("name_length")?;
        let host_name = list.read_bytes(name_length as usize, "host_name")?.to_vec();
        list.expect_end()?;
        body.expect_end()?;
        Ok(Self {
            header,
            acknowledgement: false,
            list_length: Field::with_value(list_length),
            name_type: Field::with_value(name_type),
            name_length: Field::with_value(name_length),
            host_name: Field::with_value(host_name),
        })
    }
}

impl ProtocolUnit for ServerName {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        if state.role() == Role::Server && self.host_name.get().is_none() {
            self.acknowledgement = true;
        }
        if !self.acknowledgement {
            self.host_name.fill(|| {
                state
                    .config()
                    .server_name
                    .clone()
                    .unwrap_or_default()
                    .into_bytes()
            });
            let name_len = self.host_name.emitted_len();
            self.name_type.fill(|| 0);
            self.name_length.compute(|| len_u16(name_len));
            self.list_length.compute(|| len_u16(name_len + 3));
        }
        let body_len = self.body()?.len();
        self.header.compute(ExtensionType::SERVER_NAME, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received && !self.acknowledgement {
            if let Some(host) = self.host_name.get() {
                let name = String::from_utf8_lossy(&host).into_owned();
                state.record_negotiated("server_name", |n| n.server_name = Some(name));
            }
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}
