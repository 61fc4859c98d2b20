use tlsmith_types::EngineError;

use super::{ExtensionHeader, ExtensionType};
use crate::state::ConnectionState;
use crate::unit::{Field, Origin, ProtocolUnit, Reader, UnitKind};

/// Any extension without a dedicated unit: type, length and raw body.
/// Also the way to inject arbitrary extensions into a hello.
#[derive(Debug, Clone, Default)]
pub struct GenericExtension {
    pub header: ExtensionHeader,
    pub data: Field<Vec<u8>>,
}

impl GenericExtension {
    pub const NAME: &'static str = "GenericExtension";

    pub fn new(extension_type: ExtensionType, data: Vec<u8>) -> Self {
        let mut ext = Self::default();
        ext.header.extension_type.set(extension_type.0);
        ext.data.set(data);
        ext
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, EngineError> {
        let (header, mut body) = ExtensionHeader::read(r)?;
        let data = body.read_rest().to_vec();
        Ok(Self {
            header,
            data: Field::with_value(data),
        })
    }

    pub fn extension_type(&self) -> ExtensionType {
        ExtensionType(self.header.extension_type.get().unwrap_or_default())
    }
}

impl ProtocolUnit for GenericExtension {
    fn kind(&self) -> UnitKind {
        self.extension_type().kind()
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn compute_defaults(&mut self, _state: &ConnectionState) -> Result<(), EngineError> {
        self.data.fill(Vec::new);
        let len = self.data.emitted_len();
        let extension_type = self.extension_type();
        self.header.compute(extension_type, len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header
            .write(Self::NAME, &self.data.require(Self::NAME, "extension_data")?)
    }

    fn apply(&self, _state: &mut ConnectionState, _origin: Origin) -> Result<(), EngineError> {
        Ok(())
    }

    unit_boilerplate!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::unit::Override;

    #[test]
    fn test_generic_extension_with_length_override() {
        let state = ConnectionState::new(EngineConfig::default());
        let mut ext = GenericExtension::new(ExtensionType::PADDING, vec![0; 3]);
        ext.compute_defaults(&state).unwrap();
        assert_eq!(ext.encode().unwrap(), [0, 21, 0, 3, 0, 0, 0]);
        ext.header.extension_length.set_override(Override::Explicit(0x100));
        ext.compute_defaults(&state).unwrap();
        assert_eq!(ext.encode().unwrap(), [0, 21, 1, 0, 0, 0, 0]);
    }
}
