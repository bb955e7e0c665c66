//! Packed 64-bit BDD handles.
//!
//! Field layout, MSB→LSB: negation (1) ‖ type (3) ‖ variable (16) ‖
//! hash signature (32) ‖ uniquifier (12). The layout is wire-visible:
//! refs travel inside chunks and `hash_sig % W` decides which worker
//! owns a node, so every process must pack identically. The hash width
//! is pinned by `nimbus_core::config::HASH_BITS`.
//!
//! Negation is a bit on the edge, never a node. All algorithms operate
//! on absolute refs and lift negation as they recurse; the unique table
//! only ever stores non-negated `hi` children.

pub const NEG_SHIFT: u32 = 63;
pub const TYPE_SHIFT: u32 = 60;
pub const VAR_SHIFT: u32 = 44;
pub const HASH_SHIFT: u32 = 12;

pub const VAR_MASK: u64 = (1 << 16) - 1;
pub const HASH_MASK: u64 = (1 << 32) - 1;
pub const UNIQ_MASK: u64 = (1 << 12) - 1;

/// Variable field value reserved for constants. Also the largest
/// possible level, so constants sort below every real variable.
pub const CONST_VAR: u16 = VAR_MASK as u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefType {
    Null = 0,
    Constant = 1,
    Variable = 2,
    Function = 3,
    Recurse = 4,
    Invalid = 5,
}

/// A BDD handle. Plain word on the wire; newtype in the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref(pub u64);

fn pack(neg: u64, typ: RefType, var: u16, hash: u64, uniq: u64) -> u64 {
    ((neg & 1) << NEG_SHIFT)
        | ((typ as u64) << TYPE_SHIFT)
        | ((var as u64) << VAR_SHIFT)
        | ((hash & HASH_MASK) << HASH_SHIFT)
        | (uniq & UNIQ_MASK)
}

impl Ref {
    pub const ZERO: Ref = Ref((1 << NEG_SHIFT) | ((RefType::Constant as u64) << TYPE_SHIFT) | ((CONST_VAR as u64) << VAR_SHIFT));
    pub const ONE: Ref = Ref(((RefType::Constant as u64) << TYPE_SHIFT) | ((CONST_VAR as u64) << VAR_SHIFT));
    pub const RECURSE: Ref = Ref((RefType::Recurse as u64) << TYPE_SHIFT);
    pub const INVALID: Ref = Ref((RefType::Invalid as u64) << TYPE_SHIFT);

    pub fn variable(idx: u16) -> Ref {
        Ref(pack(0, RefType::Variable, idx, 0, 0))
    }

    pub fn function(var: u16, hash: u64, uniq: u64) -> Ref {
        Ref(pack(0, RefType::Function, var, hash, uniq))
    }

    pub fn from_word(w: u64) -> Ref {
        Ref(w)
    }

    pub fn word(self) -> u64 {
        self.0
    }

    pub fn ref_type(self) -> RefType {
        match (self.0 >> TYPE_SHIFT) & 0x7 {
            0 => RefType::Null,
            1 => RefType::Constant,
            2 => RefType::Variable,
            3 => RefType::Function,
            4 => RefType::Recurse,
            _ => RefType::Invalid,
        }
    }

    pub fn is_neg(self) -> bool {
        (self.0 >> NEG_SHIFT) & 1 == 1
    }

    /// Variable index field. For constants this is `CONST_VAR`, which
    /// doubles as the bottom level in ordering comparisons.
    pub fn var_index(self) -> u16 {
        ((self.0 >> VAR_SHIFT) & VAR_MASK) as u16
    }

    pub fn hash_sig(self) -> u64 {
        (self.0 >> HASH_SHIFT) & HASH_MASK
    }

    pub fn uniq(self) -> u64 {
        self.0 & UNIQ_MASK
    }

    pub fn negate(self) -> Ref {
        Ref(self.0 ^ (1 << NEG_SHIFT))
    }

    pub fn negate_if(self, cond: bool) -> Ref {
        if cond {
            self.negate()
        } else {
            self
        }
    }

    /// Strip the negation bit.
    pub fn absval(self) -> Ref {
        Ref(self.0 & !(1u64 << NEG_SHIFT))
    }

    pub fn is_const(self) -> bool {
        self.ref_type() == RefType::Constant
    }

    pub fn is_var(self) -> bool {
        self.ref_type() == RefType::Variable
    }

    pub fn is_fun(self) -> bool {
        self.ref_type() == RefType::Function
    }

    pub fn is_invalid(self) -> bool {
        self.ref_type() == RefType::Invalid
    }
}

impl std::fmt::Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.is_neg() { '-' } else { '+' };
        match self.ref_type() {
            RefType::Null => write!(f, "NULL"),
            RefType::Constant => write!(f, "{sign}C"),
            RefType::Variable => write!(f, "{sign}V.{}", self.var_index()),
            RefType::Function => write!(
                f,
                "{sign}F.{}.{:x}+{}",
                self.var_index(),
                self.hash_sig(),
                self.uniq()
            ),
            _ => write!(
                f,
                "{sign}I.{}.{:x}+{}",
                self.var_index(),
                self.hash_sig(),
                self.uniq()
            ),
        }
    }
}

impl std::fmt::Debug for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_negations_of_each_other() {
        assert_eq!(Ref::ZERO, Ref::ONE.negate());
        assert_eq!(Ref::ONE, Ref::ZERO.negate());
        assert_eq!(Ref::ZERO.absval(), Ref::ONE);
        assert!(Ref::ZERO.is_const());
        assert_eq!(Ref::ZERO.var_index(), CONST_VAR);
    }

    #[test]
    fn field_round_trip() {
        let r = Ref::function(17, 0xdead_beef, 3);
        assert_eq!(r.ref_type(), RefType::Function);
        assert_eq!(r.var_index(), 17);
        assert_eq!(r.hash_sig(), 0xdead_beef);
        assert_eq!(r.uniq(), 3);
        assert!(!r.is_neg());

        let n = r.negate();
        assert!(n.is_neg());
        assert_eq!(n.absval(), r);
        assert_eq!(n.var_index(), 17);
        assert_eq!(n.hash_sig(), 0xdead_beef);
    }

    #[test]
    fn negation_is_an_involution() {
        let v = Ref::variable(5);
        assert_eq!(v.negate().negate(), v);
        assert_ne!(v.negate(), v);
    }

    #[test]
    fn layout_matches_wire_contract() {
        // Bit positions are protocol; lock them down.
        let r = Ref::function(1, 1, 1);
        assert_eq!(r.0, (3u64 << 60) | (1u64 << 44) | (1u64 << 12) | 1);
    }

    #[test]
    fn constants_sort_below_variables() {
        // The split-variable search relies on CONST_VAR being maximal.
        assert!(Ref::variable(0xfffe).var_index() < Ref::ONE.var_index());
    }

    #[test]
    fn sentinel_types_decode() {
        assert_eq!(Ref::RECURSE.ref_type(), RefType::Recurse);
        assert_eq!(Ref::INVALID.ref_type(), RefType::Invalid);
        assert!(Ref::INVALID.is_invalid());
        assert!(!Ref::RECURSE.is_fun());
    }
}
