//! Byte cursor for decoders and big-endian writers for encoders.

use tlsmith_types::EngineError;

use super::UnitKind;

/// Bounded read cursor over one unit's bytes.
///
/// Every read names the field being read so that a failure can say where
/// parsing stopped. Offsets are absolute within the buffer handed to the
/// outermost decoder.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    unit: &'static str,
    data: &'a [u8],
    pos: usize,
    base: usize,
    parent: Option<UnitKind>,
}

impl<'a> Reader<'a> {
    pub fn new(unit: &'static str, data: &'a [u8]) -> Self {
        Self {
            unit,
            data,
            pos: 0,
            base: 0,
            parent: None,
        }
    }

    /// Record the kind of the enclosing unit. Nested decoders whose wire
    /// form depends on the container (extensions) look at it.
    pub fn with_parent(mut self, parent: UnitKind) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn parent(&self) -> Option<UnitKind> {
        self.parent
    }

    /// Position relative to the start of this reader.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Absolute offset, including the offset of any enclosing reader.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    /// All bytes this reader spans, consumed or not.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn unit(&self) -> &'static str {
        self.unit
    }

    /// Rename the unit reported in errors (used once a dispatcher knows
    /// which concrete unit is being decoded).
    pub fn set_unit(&mut self, unit: &'static str) {
        self.unit = unit;
    }

    pub fn malformed(&self, field: &'static str) -> EngineError {
        EngineError::MalformedUnit {
            unit: self.unit,
            field,
            offset: self.offset(),
        }
    }

    /// Fail unless every byte of this reader has been consumed.
    pub fn expect_end(&self) -> Result<(), EngineError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self.malformed("trailing data"))
        }
    }

    pub fn read_bytes(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], EngineError> {
        if self.remaining() < n {
            return Err(self.malformed(field));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, EngineError> {
        Ok(self.read_bytes(1, field)?[0])
    }

    pub fn read_u16(&mut self, field: &'static str) -> Result<u16, EngineError> {
        let b = self.read_bytes(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u24(&mut self, field: &'static str) -> Result<u32, EngineError> {
        let b = self.read_bytes(3, field)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, EngineError> {
        let b = self.read_bytes(4, field)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u48(&mut self, field: &'static str) -> Result<u64, EngineError> {
        let b = self.read_bytes(6, field)?;
        Ok(u64::from_be_bytes([0, 0, b[0], b[1], b[2], b[3], b[4], b[5]]))
    }

    /// QUIC variable-length integer (RFC 9000 Section 16).
    pub fn read_varint(&mut self, field: &'static str) -> Result<u64, EngineError> {
        let first = self.peek_u8(field)?;
        let len = 1usize << (first >> 6);
        let b = self.read_bytes(len, field)?;
        let mut v = u64::from(b[0] & 0x3F);
        for byte in &b[1..] {
            v = (v << 8) | u64::from(*byte);
        }
        Ok(v)
    }

    pub fn peek_u8(&self, field: &'static str) -> Result<u8, EngineError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.malformed(field))
    }

    /// Everything not yet consumed.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    /// A child reader over the next `n` bytes; offsets stay absolute.
    pub fn sub_reader(&mut self, n: usize, field: &'static str) -> Result<Reader<'a>, EngineError> {
        let base = self.offset();
        let data = self.read_bytes(n, field)?;
        Ok(Reader {
            unit: self.unit,
            data,
            pos: 0,
            base,
            parent: self.parent,
        })
    }
}

pub fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u24(buf: &mut Vec<u8>, v: u32) {
    buf.push((v >> 16) as u8);
    buf.push((v >> 8) as u8);
    buf.push(v as u8);
}

pub fn put_u48(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes()[2..]);
}

/// Shortest QUIC varint encoding. Values above 2^62-1 are truncated to 62 bits.
pub fn put_varint(buf: &mut Vec<u8>, v: u64) {
    let v = v & 0x3FFF_FFFF_FFFF_FFFF;
    if v < 1 << 6 {
        buf.push(v as u8);
    } else if v < 1 << 14 {
        buf.extend_from_slice(&((v as u16) | 0x4000).to_be_bytes());
    } else if v < 1 << 30 {
        buf.extend_from_slice(&((v as u32) | 0x8000_0000).to_be_bytes());
    } else {
        buf.extend_from_slice(&(v | 0xC000_0000_0000_0000).to_be_bytes());
    }
}

pub fn varint_len(v: u64) -> usize {
    if v < 1 << 6 {
        1
    } else if v < 1 << 14 {
        2
    } else if v < 1 << 30 {
        4
    } else {
        8
    }
}
