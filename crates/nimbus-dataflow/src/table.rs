//! Operator and deferred-operand tables.
//!
//! Invariants:
//!   - every operator in the table has at least one empty argument
//!     slot; a full operator is returned to the caller for firing and
//!     never stored
//!   - a deferred operand exists only while its target operator has
//!     not yet arrived; operator arrival drains the whole list before
//!     the fire check
//!
//! Operand/operator arrival order is immaterial: an operator fires
//! exactly when its mask fills, whichever side showed up first.

use std::collections::HashMap;

use nimbus_core::wire::{self, Destination, OPER_HEADER_LEN};
use nimbus_core::Chunk;

/// Word index of the valid-mask word inside an operator chunk.
const MASK_WORD: usize = 2;

/// Join buffer for out-of-order operator/operand arrival.
#[derive(Default)]
pub struct OperatorTable {
    operators: HashMap<u64, Chunk>,
    deferred: HashMap<u64, Vec<(Chunk, u8)>>,
    bytes: u64,
    pub byte_peak: u64,
}

/// Insert one word into an operator, updating its mask word. A filled
/// slot is a protocol violation: logged, insert dropped.
pub fn op_insert_word(op: &mut Chunk, word: u64, offset: usize) -> bool {
    let mask = op.word(MASK_WORD);
    let bit = 1u64 << offset;
    if mask & bit != 0 {
        tracing::warn!(offset, "double fill of operator slot");
        return false;
    }
    op.overwrite(word, offset);
    op.overwrite(mask | bit, MASK_WORD);
    true
}

/// Copy an operand's payload words into an operator at the operand's
/// carried offset.
pub fn op_insert_operand(op: &mut Chunk, oper: &Chunk, offset: u8) -> bool {
    let mut ok = true;
    for i in 0..oper.len().saturating_sub(OPER_HEADER_LEN) {
        ok &= op_insert_word(op, oper.word(i + OPER_HEADER_LEN), i + offset as usize);
    }
    ok
}

/// True when every slot of the operator carries data.
pub fn op_full(op: &Chunk) -> bool {
    let full = if op.len() == nimbus_core::CHUNK_MAX_LEN {
        !0u64
    } else {
        (1u64 << op.len()) - 1
    };
    op.word(MASK_WORD) == full
}

fn chunk_bytes(c: &Chunk) -> u64 {
    16 + 8 * c.len() as u64
}

impl OperatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.values().map(Vec::len).sum()
    }

    fn note_bytes(&mut self, delta: i64) {
        self.bytes = self.bytes.saturating_add_signed(delta);
        if self.bytes > self.byte_peak {
            self.byte_peak = self.bytes;
        }
    }

    /// A newly arrived operator. Merges any deferred operands; returns
    /// the operator when it is ready to fire, `None` when it was
    /// queued (or dropped on ID collision).
    pub fn receive_operation(&mut self, mut op: Chunk) -> Option<Chunk> {
        let id = op.word(1);
        if self.operators.contains_key(&id) {
            tracing::warn!(id = format_args!("{id:#x}"), "operator ID collision, dropped");
            return None;
        }
        if let Some(waiting) = self.deferred.remove(&id) {
            for (oper, offset) in &waiting {
                self.note_bytes(-(chunk_bytes(oper) as i64));
                op_insert_operand(&mut op, oper, *offset);
                tracing::trace!(
                    id = format_args!("{id:#x}"),
                    offset,
                    "merged deferred operand"
                );
            }
        }
        if op_full(&op) {
            return Some(op);
        }
        self.note_bytes(chunk_bytes(&op) as i64);
        self.operators.insert(id, op);
        None
    }

    /// A newly arrived operand. Returns the completed operator when
    /// this operand saturated its mask.
    pub fn receive_operand(&mut self, oper: Chunk) -> Option<Chunk> {
        let dest = Destination::unpack(oper.word(0), oper.word(1));
        let id = dest.operator_id;
        match self.operators.get_mut(&id) {
            Some(op) => {
                op_insert_operand(op, &oper, dest.offset);
                if op_full(op) {
                    let op = self.operators.remove(&id)?;
                    self.note_bytes(-(chunk_bytes(&op) as i64));
                    Some(op)
                } else {
                    None
                }
            }
            None => {
                self.note_bytes(chunk_bytes(&oper) as i64);
                self.deferred.entry(id).or_default().push((oper, dest.offset));
                tracing::trace!(id = format_args!("{id:#x}"), "operand deferred");
                None
            }
        }
    }

    /// Table-mask invariant: no stored operator is full.
    #[cfg(test)]
    fn masks_strictly_partial(&self) -> bool {
        self.operators.values().all(|op| !op_full(op))
    }

    pub fn clear(&mut self) {
        self.operators.clear();
        self.deferred.clear();
        self.bytes = 0;
    }
}
