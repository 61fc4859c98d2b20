//! Incremental reassembly state.

use tlsmith_types::EngineError;
use tracing::warn;

use super::{OverlapConflict, OverlapPolicy, Reassembled};
use crate::unit::UnitKind;

/// Largest out-of-order window a [`StreamAssembler`] buffers.
pub const MAX_STREAM_WINDOW: usize = 1 << 20;

/// Resolve one incoming byte against an already placed byte.
/// Returns the byte to keep, or the conflict error under `Strict`.
fn resolve(
    policy: OverlapPolicy,
    sequence: u64,
    offset: usize,
    existing: u8,
    incoming: u8,
    conflicts: &mut Vec<OverlapConflict>,
) -> Result<u8, EngineError> {
    if existing == incoming {
        return Ok(existing);
    }
    let (kept, discarded) = match policy {
        OverlapPolicy::FirstWins => (existing, incoming),
        OverlapPolicy::LastWins => (incoming, existing),
        OverlapPolicy::Strict => return Err(EngineError::OverlapConflict { sequence, offset }),
    };
    warn!(sequence, offset, kept, discarded, ?policy, "overlapping fragments disagree");
    conflicts.push(OverlapConflict {
        sequence,
        offset,
        kept,
        discarded,
    });
    Ok(kept)
}

/// Reassembly of one unit (kind + sequence) from fragments in any order.
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    kind: UnitKind,
    sequence: u64,
    policy: OverlapPolicy,
    data: Vec<u8>,
    covered: Vec<bool>,
    covered_count: usize,
    conflicts: Vec<OverlapConflict>,
}

impl ReassemblyBuffer {
    pub fn new(kind: UnitKind, sequence: u64, total_length: usize, policy: OverlapPolicy) -> Self {
        Self {
            kind,
            sequence,
            policy,
            data: vec![0; total_length],
            covered: vec![false; total_length],
            covered_count: 0,
            conflicts: Vec::new(),
        }
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Length the buffer must cover. Grows when a fragment reaches past the
    /// announced total.
    pub fn total_length(&self) -> usize {
        self.data.len()
    }

    /// Place `payload` at `offset`.
    pub fn insert(&mut self, offset: usize, payload: &[u8]) -> Result<(), EngineError> {
        let end = offset + payload.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
            self.covered.resize(end, false);
        }
        for (i, &byte) in payload.iter().enumerate() {
            let pos = offset + i;
            if self.covered[pos] {
                self.data[pos] = resolve(
                    self.policy,
                    self.sequence,
                    pos,
                    self.data[pos],
                    byte,
                    &mut self.conflicts,
                )?;
            } else {
                self.data[pos] = byte;
                self.covered[pos] = true;
                self.covered_count += 1;
            }
        }
        Ok(())
    }

    pub fn missing(&self) -> usize {
        self.data.len() - self.covered_count
    }

    pub fn is_complete(&self) -> bool {
        self.missing() == 0
    }

    pub fn conflicts(&self) -> &[OverlapConflict] {
        &self.conflicts
    }

    /// The reassembled bytes, or `IncompleteReassembly` if any position is
    /// uncovered.
    pub fn finish(self) -> Result<Reassembled, EngineError> {
        if !self.is_complete() {
            return Err(EngineError::IncompleteReassembly {
                sequence: self.sequence,
                missing: self.missing(),
                total: self.data.len(),
            });
        }
        Ok(Reassembled {
            kind: self.kind,
            sequence: self.sequence,
            bytes: self.data,
            conflicts: self.conflicts,
        })
    }

    /// Covered bytes so far, uncovered positions as zero.
    pub fn partial_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Offset-addressed byte stream (QUIC CRYPTO data) delivered in order.
#[derive(Debug, Clone, Default)]
pub struct StreamAssembler {
    policy: OverlapPolicy,
    delivered: u64,
    window: Vec<Option<u8>>,
    conflicts: Vec<OverlapConflict>,
}

impl StreamAssembler {
    pub fn new(policy: OverlapPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Offset of the next byte not yet handed out.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Buffer `data` at stream `offset`. Bytes already handed out are
    /// ignored.
    pub fn insert(&mut self, offset: u64, data: &[u8]) -> Result<(), EngineError> {
        for (i, &byte) in data.iter().enumerate() {
            let pos = offset + i as u64;
            if pos < self.delivered {
                continue;
            }
            let idx = (pos - self.delivered) as usize;
            if idx >= MAX_STREAM_WINDOW {
                return Err(EngineError::Layer(format!(
                    "stream offset {pos} beyond reassembly window"
                )));
            }
            if idx >= self.window.len() {
                self.window.resize(idx + 1, None);
            }
            self.window[idx] = Some(match self.window[idx] {
                Some(existing) => resolve(
                    self.policy,
                    0,
                    pos as usize,
                    existing,
                    byte,
                    &mut self.conflicts,
                )?,
                None => byte,
            });
        }
        Ok(())
    }

    /// Take the contiguous bytes starting at the delivered offset.
    pub fn read_contiguous(&mut self) -> Vec<u8> {
        let n = self.window.iter().take_while(|b| b.is_some()).count();
        let out: Vec<u8> = self.window.drain(..n).flatten().collect();
        self.delivered += n as u64;
        out
    }

    /// Whether bytes past a gap are buffered.
    pub fn has_gap(&self) -> bool {
        !self.window.is_empty()
    }

    pub fn conflicts(&self) -> &[OverlapConflict] {
        &self.conflicts
    }
}
