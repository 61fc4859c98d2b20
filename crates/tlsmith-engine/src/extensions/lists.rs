//! Extensions whose body is a u16-length list of u16 code points.

use tlsmith_types::{EngineError, NamedGroup, SignatureScheme};

use super::{ExtensionHeader, ExtensionType};
use crate::state::ConnectionState;
use crate::unit::codec::put_u16;
use crate::unit::{len_u16, Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitKind};

fn read_list(r: &mut Reader<'_>) -> Result<(u16, Vec<u16>), EngineError> {
    let list_length = r.read_u16("list_length")?;
    let mut list = r.sub_reader(list_length as usize, "list")?;
    let mut items = Vec::with_capacity(list_length as usize / 2);
    while !list.is_empty() {
        items.push(list.read_u16("list_item")?);
    }
    Ok((list_length, items))
}

fn write_list(unit: &'static str, length: &Field<u16>, items: &Field<Vec<u16>>) -> Result<Vec<u8>, EngineError> {
    let items = items.require(unit, "list")?;
    let mut out = Vec::with_capacity(2 + items.len() * 2);
    put_u16(&mut out, length.require(unit, "list_length")?);
    for item in items {
        put_u16(&mut out, item);
    }
    Ok(out)
}

/// supported_groups (RFC 8446 Section 4.2.7).
#[derive(Debug, Clone, Default)]
pub struct SupportedGroups {
    pub header: ExtensionHeader,
    pub list_length: Field<u16>,
    pub groups: Field<Vec<u16>>,
}

impl SupportedGroups {
    fn body(&self) -> Result<Vec<u8>, EngineError> {
        write_list(Self::NAME, &self.list_length, &self.groups)
    }
}

impl RegisteredUnit for SupportedGroups {
    const KIND: UnitKind = ExtensionType::SUPPORTED_GROUPS.kind();
    const NAME: &'static str = "SupportedGroups";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = ExtensionHeader::read(r)?;
        let (list_length, groups) = read_list(&mut body)?;
        body.expect_end()?;
        Ok(Self {
            header,
            list_length: Field::with_value(list_length),
            groups: Field::with_value(groups),
        })
    }
}

impl ProtocolUnit for SupportedGroups {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        self.groups
            .fill(|| state.config().named_groups.iter().map(|g| g.0).collect());
        let count = self.groups.emitted_len();
        self.list_length.compute(|| len_u16(count * 2));
        let body_len = self.body()?.len();
        self.header.compute(ExtensionType::SUPPORTED_GROUPS, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received {
            let groups: Vec<NamedGroup> = self
                .groups
                .get()
                .unwrap_or_default()
                .into_iter()
                .map(NamedGroup)
                .collect();
            state.record_negotiated("peer_groups", |n| n.peer_groups = groups);
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

/// signature_algorithms (RFC 8446 Section 4.2.3).
#[derive(Debug, Clone, Default)]
pub struct SignatureAlgorithms {
    pub header: ExtensionHeader,
    pub list_length: Field<u16>,
    pub schemes: Field<Vec<u16>>,
}

impl SignatureAlgorithms {
    fn body(&self) -> Result<Vec<u8>, EngineError> {
        write_list(Self::NAME, &self.list_length, &self.schemes)
    }
}

impl RegisteredUnit for SignatureAlgorithms {
    const KIND: UnitKind = ExtensionType::SIGNATURE_ALGORITHMS.kind();
    const NAME: &'static str = "SignatureAlgorithms";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = ExtensionHeader::read(r)?;
        let (list_length, schemes) = read_list(&mut body)?;
        body.expect_end()?;
        Ok(Self {
            header,
            list_length: Field::with_value(list_length),
            schemes: Field::with_value(schemes),
        })
    }
}

impl ProtocolUnit for SignatureAlgorithms {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        self.schemes
            .fill(|| state.config().signature_schemes.iter().map(|s| s.0).collect());
        let count = self.schemes.emitted_len();
        self.list_length.compute(|| len_u16(count * 2));
        let body_len = self.body()?.len();
        self.header
            .compute(ExtensionType::SIGNATURE_ALGORITHMS, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received {
            let schemes: Vec<SignatureScheme> = self
                .schemes
                .get()
                .unwrap_or_default()
                .into_iter()
                .map(SignatureScheme)
                .collect();
            state.record_negotiated("peer_signature_schemes", |n| {
                n.peer_signature_schemes = schemes
            });
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}
