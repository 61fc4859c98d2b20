//! Fragmentation and reassembly for unreliable transports.
//!
//! [`fragment`] encodes a unit once and cuts the bytes into consecutive,
//! non-overlapping ranges. Reassembly places each payload at its offset; an
//! uncovered byte yields [`EngineError::IncompleteReassembly`], disagreeing
//! bytes are resolved by the configured [`OverlapPolicy`].

pub mod buffer;
pub mod dtls;
pub mod retransmit;

use serde::{Deserialize, Serialize};
use tlsmith_types::EngineError;

use crate::unit::{ProtocolUnit, UnitKind};

pub use buffer::{ReassemblyBuffer, StreamAssembler};
pub use dtls::DtlsHandshakeFragment;
pub use retransmit::{Flight, RetransmitTimer};

/// Resolution rule for overlapping fragments that disagree on a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverlapPolicy {
    /// Keep the byte seen first; log the conflict.
    #[default]
    FirstWins,
    /// Keep the byte seen last; log the conflict.
    LastWins,
    /// Fail reassembly with [`EngineError::OverlapConflict`].
    Strict,
}

/// A byte range of one unit's encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub kind: UnitKind,
    /// Identifies the unit instance (DTLS message_seq, stream id, ...).
    pub sequence: u64,
    pub offset: usize,
    /// Length of the whole encoding the fragment belongs to.
    pub total_length: usize,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn end(&self) -> usize {
        self.offset + self.payload.len()
    }
}

/// Two fragments disagreed on the byte at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OverlapConflict {
    pub sequence: u64,
    pub offset: usize,
    pub kept: u8,
    pub discarded: u8,
}

/// Output of a successful reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub kind: UnitKind,
    pub sequence: u64,
    pub bytes: Vec<u8>,
    pub conflicts: Vec<OverlapConflict>,
}

/// Cut `bytes` into ranges of at most `max` bytes. Empty input still yields
/// one (empty) fragment so that the unit is delivered.
pub fn split(kind: UnitKind, sequence: u64, bytes: &[u8], max: usize) -> Vec<Fragment> {
    let max = max.max(1);
    if bytes.is_empty() {
        return vec![Fragment {
            kind,
            sequence,
            offset: 0,
            total_length: 0,
            payload: Vec::new(),
        }];
    }
    bytes
        .chunks(max)
        .enumerate()
        .map(|(i, chunk)| Fragment {
            kind,
            sequence,
            offset: i * max,
            total_length: bytes.len(),
            payload: chunk.to_vec(),
        })
        .collect()
}

/// Encode `unit` once and split the encoding into ranges of at most `max`
/// bytes.
pub fn fragment(
    unit: &dyn ProtocolUnit,
    sequence: u64,
    max: usize,
) -> Result<Vec<Fragment>, EngineError> {
    let bytes = unit.encode()?;
    Ok(split(unit.kind(), sequence, &bytes, max))
}

/// The whole encoding as a single fragment.
pub fn wrap_whole(unit: &dyn ProtocolUnit, sequence: u64) -> Result<Fragment, EngineError> {
    let bytes = unit.encode()?;
    Ok(Fragment {
        kind: unit.kind(),
        sequence,
        offset: 0,
        total_length: bytes.len(),
        payload: bytes,
    })
}

/// Reassemble fragments sharing one kind and sequence.
pub fn reassemble(fragments: &[Fragment], policy: OverlapPolicy) -> Result<Reassembled, EngineError> {
    let first = fragments
        .first()
        .ok_or_else(|| EngineError::Layer("no fragments to reassemble".into()))?;
    let mut buffer =
        ReassemblyBuffer::new(first.kind, first.sequence, first.total_length, policy);
    for f in fragments {
        if f.kind != first.kind || f.sequence != first.sequence {
            return Err(EngineError::Layer(format!(
                "fragment of {}#{} mixed into {}#{}",
                f.kind, f.sequence, first.kind, first.sequence
            )));
        }
        buffer.insert(f.offset, &f.payload)?;
    }
    buffer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{OpaqueUnit, UnitFamily};
    use proptest::prelude::*;

    fn kind() -> UnitKind {
        UnitKind::new(UnitFamily::Handshake, 11)
    }

    #[test]
    fn test_three_thousand_bytes_in_thousand_byte_pieces() {
        let unit = OpaqueUnit::new(UnitFamily::Handshake, vec![0xAB; 3000]);
        let fragments = fragment(&unit, 0, 1000).unwrap();
        assert_eq!(fragments.len(), 3);
        let offsets: Vec<usize> = fragments.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, [0, 1000, 2000]);
        assert!(fragments.iter().all(|f| f.payload.len() == 1000));

        let err = reassemble(&fragments[..2], OverlapPolicy::FirstWins).unwrap_err();
        assert!(matches!(
            err,
            EngineError::IncompleteReassembly {
                missing: 1000,
                total: 3000,
                ..
            }
        ));
    }

    #[test]
    fn test_wrap_whole_is_one_fragment() {
        let unit = OpaqueUnit::new(UnitFamily::Record, vec![1, 2, 3]);
        let whole = wrap_whole(&unit, 4).unwrap();
        assert_eq!(whole.offset, 0);
        assert_eq!(whole.payload, [1, 2, 3]);
        assert_eq!(whole.sequence, 4);
    }

    #[test]
    fn test_empty_unit_still_yields_a_fragment() {
        let fragments = split(kind(), 0, &[], 10);
        assert_eq!(fragments.len(), 1);
        let out = reassemble(&fragments, OverlapPolicy::FirstWins).unwrap();
        assert!(out.bytes.is_empty());
    }

    #[test]
    fn test_overlap_policies() {
        let a = Fragment {
            kind: kind(),
            sequence: 1,
            offset: 0,
            total_length: 4,
            payload: vec![1, 2, 3],
        };
        let b = Fragment {
            offset: 2,
            payload: vec![9, 4],
            ..a.clone()
        };
        let first = reassemble(&[a.clone(), b.clone()], OverlapPolicy::FirstWins).unwrap();
        assert_eq!(first.bytes, [1, 2, 3, 4]);
        assert_eq!(
            first.conflicts,
            [OverlapConflict {
                sequence: 1,
                offset: 2,
                kept: 3,
                discarded: 9
            }]
        );
        let last = reassemble(&[a.clone(), b.clone()], OverlapPolicy::LastWins).unwrap();
        assert_eq!(last.bytes, [1, 2, 9, 4]);
        assert!(matches!(
            reassemble(&[a, b], OverlapPolicy::Strict),
            Err(EngineError::OverlapConflict {
                sequence: 1,
                offset: 2
            })
        ));
    }

    #[test]
    fn test_mixed_sequences_rejected() {
        let a = split(kind(), 1, &[1, 2], 1);
        let mut b = split(kind(), 2, &[1, 2], 1);
        b.extend(a);
        assert!(matches!(
            reassemble(&b, OverlapPolicy::FirstWins),
            Err(EngineError::Layer(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_fragment_then_reassemble_is_identity(
            bytes in proptest::collection::vec(any::<u8>(), 0..2048),
            max in 1usize..600,
        ) {
            let unit = OpaqueUnit::new(UnitFamily::Handshake, bytes.clone());
            let mut fragments = fragment(&unit, 7, max).unwrap();
            prop_assert!(fragments.iter().all(|f| f.payload.len() <= max));
            fragments.reverse();
            let out = reassemble(&fragments, OverlapPolicy::Strict).unwrap();
            prop_assert_eq!(out.bytes, bytes);
            prop_assert!(out.conflicts.is_empty());
        }
    }
}
