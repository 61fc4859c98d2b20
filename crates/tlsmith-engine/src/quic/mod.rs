//! QUIC frames (RFC 9000 Section 19).
//!
//! Only the frames needed to carry a handshake are modelled. Packet headers
//! and packet protection are not: the frame layer writes frames straight
//! into datagrams. Every frame starts with its type as a varint, and the
//! unit kind code is that type.

mod frames;

use tlsmith_types::EngineError;

use crate::unit::{Reader, UnitFamily, UnitKind, UnitRegistry};

pub use frames::{Ack, ConnectionClose, Crypto, Padding, Ping};

/// QUIC frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameType(pub u64);

impl FrameType {
    pub const PADDING: Self = Self(0x00);
    pub const PING: Self = Self(0x01);
    pub const ACK: Self = Self(0x02);
    pub const CRYPTO: Self = Self(0x06);
    pub const CONNECTION_CLOSE: Self = Self(0x1c);
    pub const CONNECTION_CLOSE_APPLICATION: Self = Self(0x1d);

    /// Unit kind for this frame type; types beyond the code space are
    /// opaque.
    pub const fn kind(self) -> UnitKind {
        if self.0 < UnitKind::OPAQUE_CODE as u64 {
            UnitKind::new(UnitFamily::QuicFrame, self.0 as u16)
        } else {
            UnitKind::opaque(UnitFamily::QuicFrame)
        }
    }
}

/// Kind of the frame at the cursor, without consuming anything.
pub fn peek_kind(r: &Reader<'_>) -> Result<UnitKind, EngineError> {
    let mut peek = r.clone();
    Ok(FrameType(peek.read_varint("frame_type")?).kind())
}

pub(crate) fn register(registry: &mut UnitRegistry) {
    frames::register(registry);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_kind_does_not_consume() {
        let r = Reader::new("Frame", &[0x40, 0x06, 0x00]);
        assert_eq!(peek_kind(&r).unwrap(), FrameType::CRYPTO.kind());
        assert_eq!(r.position(), 0);
        assert!(FrameType(0x1_0000).kind().is_opaque());
    }
}
