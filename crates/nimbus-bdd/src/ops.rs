//! Distributed BDD operator layouts.
//!
//! Each operator is a chunk: 3 header words (header, operator ID, valid
//! mask) followed by argument slots. Embedded destinations occupy two
//! slots — always read back through the double-word accessors. Slots
//! marked `*` below start empty and are filled by operands.
//!
//! ```text
//! VAR             (dest)                                  worker 0
//! CANONIZE        (dest, v, *hi, *lo)                     any worker
//! CANONIZE_LOOKUP (dest, hash, v, hi, lo, negate)         hash % W
//! RETRIEVE_LOOKUP (dest, ref)                             hash(ref) % W
//! ITE_LOOKUP      (dest, i, t, e, negate)                 hash(i,t,e) % W
//! ITE_RECURSE     (dest, v, *ihi,*ilo,*thi,*tlo,*ehi,*elo) any worker
//! ITE_STORE       (dest, i, t, e, *ref, negate)           issuing worker
//! UOP_DOWN        (dest, uid, ref)                        hash(|ref|) % W
//! UOP_UP          (dest, uid, ref, *hival, *loval)        issuing worker
//! UOP_STORE       (dest, uid, ref, *val)                  issuing worker
//! ```

use nimbus_core::wire::{self, Destination, OP_HEADER_LEN};
use nimbus_core::Chunk;

use crate::refs::Ref;

pub const OP_VAR: u8 = 0;
pub const OP_CANONIZE: u8 = 1;
pub const OP_CANONIZE_LOOKUP: u8 = 2;
pub const OP_RETRIEVE_LOOKUP: u8 = 3;
pub const OP_ITE_LOOKUP: u8 = 4;
pub const OP_ITE_RECURSE: u8 = 5;
pub const OP_ITE_STORE: u8 = 6;
pub const OP_UOP_DOWN: u8 = 7;
pub const OP_UOP_UP: u8 = 8;
pub const OP_UOP_STORE: u8 = 9;

/// First argument slot of every operator; destinations start here.
pub const ARG0: usize = OP_HEADER_LEN;

/// The worker owning a hash value.
pub fn owner_of_hash(hash: u64, nworkers: u16) -> u16 {
    (hash % nworkers as u64) as u16
}

fn with_dest(mut op: Chunk, dest: Destination) -> Chunk {
    let (w0, w1) = dest.pack();
    op.overwrite(w0, ARG0);
    op.overwrite(w1, ARG0 + 1);
    op
}

pub fn build_var(worker: u16, id: u64, dest: Destination) -> Chunk {
    let op = wire::new_operator(OP_VAR, worker, id, ARG0 + 2);
    with_dest(op, dest)
}

/// CANONIZE with the hi/lo slots left open for operands.
pub fn build_canonize(worker: u16, id: u64, dest: Destination, v: Ref) -> Chunk {
    let mut op = wire::new_operator(OP_CANONIZE, worker, id, ARG0 + 5);
    op = with_dest(op, dest);
    op.overwrite(v.word(), ARG0 + 2);
    op
}

pub const CANONIZE_HI_SLOT: u8 = (ARG0 + 3) as u8;
pub const CANONIZE_LO_SLOT: u8 = (ARG0 + 4) as u8;

#[allow(clippy::too_many_arguments)]
pub fn build_canonize_lookup(
    worker: u16,
    id: u64,
    dest: Destination,
    hash: u64,
    v: Ref,
    hi: Ref,
    lo: Ref,
    negate: bool,
) -> Chunk {
    let mut op = wire::new_operator(OP_CANONIZE_LOOKUP, worker, id, ARG0 + 7);
    op = with_dest(op, dest);
    op.overwrite(hash, ARG0 + 2);
    op.overwrite(v.word(), ARG0 + 3);
    op.overwrite(hi.word(), ARG0 + 4);
    op.overwrite(lo.word(), ARG0 + 5);
    op.overwrite(negate as u64, ARG0 + 6);
    op
}

pub fn build_retrieve_lookup(worker: u16, id: u64, dest: Destination, r: Ref) -> Chunk {
    let mut op = wire::new_operator(OP_RETRIEVE_LOOKUP, worker, id, ARG0 + 3);
    op = with_dest(op, dest);
    op.overwrite(r.word(), ARG0 + 2);
    op
}

pub fn build_ite_lookup(
    worker: u16,
    id: u64,
    dest: Destination,
    i: Ref,
    t: Ref,
    e: Ref,
    negate: bool,
) -> Chunk {
    let mut op = wire::new_operator(OP_ITE_LOOKUP, worker, id, ARG0 + 6);
    op = with_dest(op, dest);
    op.overwrite(i.word(), ARG0 + 2);
    op.overwrite(t.word(), ARG0 + 3);
    op.overwrite(e.word(), ARG0 + 4);
    op.overwrite(negate as u64, ARG0 + 5);
    op
}

/// ITE_RECURSE with all six cofactor slots open.
pub fn build_ite_recurse(worker: u16, id: u64, dest: Destination, v: Ref) -> Chunk {
    let mut op = wire::new_operator(OP_ITE_RECURSE, worker, id, ARG0 + 9);
    op = with_dest(op, dest);
    op.overwrite(v.word(), ARG0 + 2);
    op
}

pub const RECURSE_IHI_SLOT: u8 = (ARG0 + 3) as u8;
pub const RECURSE_THI_SLOT: u8 = (ARG0 + 5) as u8;
pub const RECURSE_EHI_SLOT: u8 = (ARG0 + 7) as u8;

/// ITE_STORE with the result-ref slot open.
pub fn build_ite_store(
    worker: u16,
    id: u64,
    dest: Destination,
    i: Ref,
    t: Ref,
    e: Ref,
    negate: bool,
) -> Chunk {
    let mut op = wire::new_operator(OP_ITE_STORE, worker, id, ARG0 + 7);
    op = with_dest(op, dest);
    op.overwrite(i.word(), ARG0 + 2);
    op.overwrite(t.word(), ARG0 + 3);
    op.overwrite(e.word(), ARG0 + 4);
    op.overwrite(negate as u64, ARG0 + 6);
    op
}

pub const STORE_REF_SLOT: u8 = (ARG0 + 5) as u8;

pub fn build_uop_down(worker: u16, id: u64, dest: Destination, uid: u64, r: Ref) -> Chunk {
    let mut op = wire::new_operator(OP_UOP_DOWN, worker, id, ARG0 + 4);
    op = with_dest(op, dest);
    op.overwrite(uid, ARG0 + 2);
    op.overwrite(r.word(), ARG0 + 3);
    op
}

/// UOP_UP with the hival/loval slots open.
pub fn build_uop_up(worker: u16, id: u64, dest: Destination, uid: u64, r: Ref) -> Chunk {
    let mut op = wire::new_operator(OP_UOP_UP, worker, id, ARG0 + 6);
    op = with_dest(op, dest);
    op.overwrite(uid, ARG0 + 2);
    op.overwrite(r.word(), ARG0 + 3);
    op
}

pub const UOP_UP_HI_SLOT: u8 = (ARG0 + 4) as u8;
pub const UOP_UP_LO_SLOT: u8 = (ARG0 + 5) as u8;

/// UOP_STORE with the value slot open.
pub fn build_uop_store(worker: u16, id: u64, dest: Destination, uid: u64, r: Ref) -> Chunk {
    let mut op = wire::new_operator(OP_UOP_STORE, worker, id, ARG0 + 5);
    op = with_dest(op, dest);
    op.overwrite(uid, ARG0 + 2);
    op.overwrite(r.word(), ARG0 + 3);
    op
}

pub const UOP_STORE_VAL_SLOT: u8 = (ARG0 + 4) as u8;

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::wire::{header_opcode, operator_id};

    #[test]
    fn canonize_starts_with_open_child_slots() {
        let dest = Destination::new(9, operator_id(9, 1), 4);
        let op = build_canonize(0, operator_id(0, 7), dest, Ref::variable(2));
        assert!(!op.filled());
        assert!(!op.slot_valid(CANONIZE_HI_SLOT as usize));
        assert!(!op.slot_valid(CANONIZE_LO_SLOT as usize));
        assert_eq!(header_opcode(op.word(0)), OP_CANONIZE);
        assert_eq!(
            Destination::unpack(op.word(ARG0), op.word(ARG0 + 1)),
            dest
        );
    }

    #[test]
    fn fully_specified_operators_are_filled() {
        let dest = Destination::new(1, operator_id(1, 0), 3);
        let op = build_ite_lookup(
            2,
            operator_id(2, 5),
            dest,
            Ref::variable(0),
            Ref::ONE,
            Ref::ZERO,
            true,
        );
        assert!(op.filled());
        assert_eq!(op.word(ARG0 + 5), 1);
    }

    #[test]
    fn ite_store_leaves_only_the_ref_slot() {
        let dest = Destination::new(1, operator_id(1, 0), 3);
        let op = build_ite_store(
            0,
            operator_id(0, 1),
            dest,
            Ref::variable(0),
            Ref::variable(1),
            Ref::ZERO,
            false,
        );
        for slot in 0..op.len() {
            let open = slot == STORE_REF_SLOT as usize;
            assert_eq!(op.slot_valid(slot), !open, "slot {slot}");
        }
    }

    #[test]
    fn owner_is_stable_modulo_workers() {
        assert_eq!(owner_of_hash(10, 3), 1);
        assert_eq!(owner_of_hash(10, 1), 0);
        let h = crate::mgr::ite_hash(Ref::variable(0), Ref::ONE, Ref::ZERO);
        assert_eq!(owner_of_hash(h, 4), owner_of_hash(h, 4));
    }
}
