//! The unary operation framework.
//!
//! mark, support, density, cofactor (restrict), equant, and shift all
//! share one depth-first traversal with a per-invocation memo from ref
//! to word. Only the per-node combine differs. The traversal runs on
//! signed refs — dereferencing pushes negation onto the children — so
//! operations that do not commute with negation (equant in particular)
//! need no special casing.
//!
//! The same combines back the worker's distributed UOP operators; this
//! module is the in-process form used for worker GC and for tests.

use std::collections::{HashMap, HashSet};

use crate::mgr::{BddError, RefMgr};
use crate::refs::Ref;
use crate::stats;

/// Unary operation selector. The discriminant travels in CLIOP
/// payloads when a client starts a distributed traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UopKind {
    Mark = 0,
    Support = 1,
    Density = 2,
    Cofactor = 3,
    Equant = 4,
    Shift = 5,
}

impl TryFrom<u8> for UopKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0 => UopKind::Mark,
            1 => UopKind::Support,
            2 => UopKind::Density,
            3 => UopKind::Cofactor,
            4 => UopKind::Equant,
            5 => UopKind::Shift,
            other => return Err(other),
        })
    }
}

/// Input data a unary operation closes over.
#[derive(Debug, Clone, Default)]
pub enum UopAux {
    #[default]
    None,
    /// Literal set for cofactor: variable refs, possibly negated.
    Lits(HashSet<Ref>),
    /// Variable set for equant.
    Vars(HashSet<Ref>),
    /// Old-variable → new-variable map for shift.
    VarMap(HashMap<u16, u16>),
}

/// One traversal in flight: memo, aux input, and the set sink that
/// mark and support write into.
pub struct UopRun {
    pub kind: UopKind,
    pub aux: UopAux,
    pub memo: HashMap<Ref, u64>,
    pub marked: HashSet<Ref>,
}

impl UopRun {
    pub fn new(kind: UopKind, aux: UopAux) -> Self {
        UopRun {
            kind,
            aux,
            memo: HashMap::new(),
            marked: HashSet::new(),
        }
    }

    /// Leaf rule: the value of a constant node.
    pub fn leaf_value(&self, r: Ref) -> u64 {
        match self.kind {
            UopKind::Mark | UopKind::Support => 1,
            UopKind::Density => {
                if r == Ref::ONE {
                    1f64.to_bits()
                } else {
                    0f64.to_bits()
                }
            }
            UopKind::Cofactor | UopKind::Equant | UopKind::Shift => r.word(),
        }
    }

    /// Internal-node combine. `hival`/`loval` are the values of the
    /// signed hi and lo children.
    pub fn node_value(
        &mut self,
        mgr: &mut RefMgr,
        r: Ref,
        hival: u64,
        loval: u64,
    ) -> Result<u64, BddError> {
        let vr = Ref::variable(r.var_index());
        match self.kind {
            UopKind::Mark => {
                self.marked.insert(r.absval());
                Ok(1)
            }
            UopKind::Support => {
                self.marked.insert(vr);
                Ok(1)
            }
            UopKind::Density => {
                let h = f64::from_bits(hival);
                let l = f64::from_bits(loval);
                Ok(((h + l) / 2.0).to_bits())
            }
            UopKind::Cofactor => {
                let (pinned_high, pinned_low) = match &self.aux {
                    UopAux::Lits(set) => (set.contains(&vr), set.contains(&vr.negate())),
                    _ => (false, false),
                };
                if pinned_high {
                    Ok(hival)
                } else if pinned_low {
                    Ok(loval)
                } else {
                    let r = mgr.canonize(vr, Ref::from_word(hival), Ref::from_word(loval))?;
                    Ok(r.word())
                }
            }
            UopKind::Equant => {
                let quantified = matches!(&self.aux, UopAux::Vars(set) if set.contains(&vr));
                if quantified {
                    let r = mgr.or(Ref::from_word(hival), Ref::from_word(loval))?;
                    Ok(r.word())
                } else {
                    let r = mgr.canonize(vr, Ref::from_word(hival), Ref::from_word(loval))?;
                    Ok(r.word())
                }
            }
            UopKind::Shift => {
                let nv = match &self.aux {
                    UopAux::VarMap(map) => {
                        map.get(&r.var_index()).copied().unwrap_or(r.var_index())
                    }
                    _ => r.var_index(),
                };
                let r = mgr.canonize(
                    Ref::variable(nv),
                    Ref::from_word(hival),
                    Ref::from_word(loval),
                )?;
                Ok(r.word())
            }
        }
    }

    /// Memoized depth-first traversal from `r`.
    pub fn traverse(&mut self, mgr: &mut RefMgr, r: Ref) -> Result<u64, BddError> {
        if let Some(&val) = self.memo.get(&r) {
            mgr.stats[stats::STAT_UOP_HIT_CNT] += 1;
            return Ok(val);
        }
        let val = if r.is_const() {
            self.leaf_value(r)
        } else {
            let (_, hi, lo) = mgr.deref(r)?;
            let hival = self.traverse(mgr, hi)?;
            let loval = self.traverse(mgr, lo)?;
            self.node_value(mgr, r, hival, loval)?
        };
        self.memo.insert(r, val);
        mgr.stats[stats::STAT_UOP_STORE_CNT] += 1;
        Ok(val)
    }

    fn run(&mut self, mgr: &mut RefMgr, roots: &HashSet<Ref>) -> Result<(), BddError> {
        mgr.stats[stats::STAT_UOP_CNT] += 1;
        for &r in roots {
            self.traverse(mgr, r)?;
        }
        Ok(())
    }
}

/// All function nodes (absolute refs) reachable from `roots`.
pub fn reach(mgr: &mut RefMgr, roots: &HashSet<Ref>) -> Result<HashSet<Ref>, BddError> {
    let mut run = UopRun::new(UopKind::Mark, UopAux::None);
    run.run(mgr, roots)?;
    Ok(run.marked)
}

/// Variables (as refs) in the support of `roots`.
pub fn support(mgr: &mut RefMgr, roots: &HashSet<Ref>) -> Result<HashSet<Ref>, BddError> {
    let mut run = UopRun::new(UopKind::Support, UopAux::None);
    run.run(mgr, roots)?;
    Ok(run.marked)
}

/// Fraction of assignments satisfying each root.
pub fn density(mgr: &mut RefMgr, roots: &HashSet<Ref>) -> Result<HashMap<Ref, f64>, BddError> {
    let mut run = UopRun::new(UopKind::Density, UopAux::None);
    run.run(mgr, roots)?;
    Ok(roots
        .iter()
        .map(|r| (*r, f64::from_bits(run.memo[r])))
        .collect())
}

/// Satisfying-assignment counts over a universe of `nvars` variables.
pub fn count(
    mgr: &mut RefMgr,
    roots: &HashSet<Ref>,
    nvars: u32,
) -> Result<HashMap<Ref, u64>, BddError> {
    let densities = density(mgr, roots)?;
    Ok(densities
        .into_iter()
        .map(|(r, d)| (r, (d * 2f64.powi(nvars as i32)).round() as u64))
        .collect())
}

/// Cofactor each root by the literal set.
pub fn restrict(
    mgr: &mut RefMgr,
    roots: &HashSet<Ref>,
    lits: &HashSet<Ref>,
) -> Result<HashMap<Ref, Ref>, BddError> {
    let mut run = UopRun::new(UopKind::Cofactor, UopAux::Lits(lits.clone()));
    run.run(mgr, roots)?;
    Ok(value_map(&run, roots))
}

/// Existentially quantify each root over the variable set.
pub fn equant(
    mgr: &mut RefMgr,
    roots: &HashSet<Ref>,
    vars: &HashSet<Ref>,
) -> Result<HashMap<Ref, Ref>, BddError> {
    let mut run = UopRun::new(UopKind::Equant, UopAux::Vars(vars.clone()));
    run.run(mgr, roots)?;
    Ok(value_map(&run, roots))
}

/// Rename variables per `vmap`. The map must preserve level order.
pub fn shift(
    mgr: &mut RefMgr,
    roots: &HashSet<Ref>,
    vmap: &HashMap<u16, u16>,
) -> Result<HashMap<Ref, Ref>, BddError> {
    let mut run = UopRun::new(UopKind::Shift, UopAux::VarMap(vmap.clone()));
    run.run(mgr, roots)?;
    Ok(value_map(&run, roots))
}

fn value_map(run: &UopRun, roots: &HashSet<Ref>) -> HashMap<Ref, Ref> {
    roots
        .iter()
        .map(|r| (*r, Ref::from_word(run.memo[r])))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgr_with_vars(n: u16) -> (RefMgr, Vec<Ref>) {
        let mut mgr = RefMgr::new();
        let vars = (0..n).map(|_| mgr.new_variable().unwrap()).collect();
        (mgr, vars)
    }

    fn set(refs: &[Ref]) -> HashSet<Ref> {
        refs.iter().copied().collect()
    }

    #[test]
    fn density_of_and_is_quarter() {
        let (mut mgr, v) = mgr_with_vars(2);
        let f = mgr.and(v[0], v[1]).unwrap();
        let d = density(&mut mgr, &set(&[f])).unwrap();
        assert!((d[&f] - 0.25).abs() < 1e-12);

        // Counting over both variables gives the single minterm.
        let c = count(&mut mgr, &set(&[f]), 2).unwrap();
        assert_eq!(c[&f], 1);
    }

    #[test]
    fn density_respects_negation() {
        let (mut mgr, v) = mgr_with_vars(2);
        let f = mgr.and(v[0], v[1]).unwrap();
        let d = density(&mut mgr, &set(&[f.negate()])).unwrap();
        assert!((d[&f.negate()] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn support_is_contained_in_path_variables() {
        let (mut mgr, v) = mgr_with_vars(3);
        let f = mgr.and(v[0], v[2]).unwrap();
        let s = support(&mut mgr, &set(&[f])).unwrap();
        assert_eq!(s, set(&[v[0], v[2]]));
    }

    #[test]
    fn restrict_pins_literals() {
        let (mut mgr, v) = mgr_with_vars(2);
        let f = mgr.and(v[0], v[1]).unwrap();
        // f with x0 = 1 is x1; with x0 = 0 it is zero.
        let pos = restrict(&mut mgr, &set(&[f]), &set(&[v[0]])).unwrap();
        assert_eq!(pos[&f], v[1]);
        let neg = restrict(&mut mgr, &set(&[f]), &set(&[v[0].negate()])).unwrap();
        assert_eq!(neg[&f], Ref::ZERO);
    }

    #[test]
    fn restrict_is_idempotent() {
        let (mut mgr, v) = mgr_with_vars(3);
        let ab = mgr.and(v[0], v[1]).unwrap();
        let f = mgr.or(ab, v[2]).unwrap();
        let lits = set(&[v[1]]);
        let once = restrict(&mut mgr, &set(&[f]), &lits).unwrap()[&f];
        let twice = restrict(&mut mgr, &set(&[once]), &lits).unwrap()[&once];
        assert_eq!(once, twice);
    }

    #[test]
    fn equant_of_or_is_one() {
        let (mut mgr, v) = mgr_with_vars(2);
        let t = mgr.or(v[0], v[1]).unwrap();
        let q = equant(&mut mgr, &set(&[t]), &set(&[v[0]])).unwrap();
        assert_eq!(q[&t], Ref::ONE);
    }

    #[test]
    fn equant_is_idempotent() {
        let (mut mgr, v) = mgr_with_vars(3);
        let ab = mgr.and(v[0], v[1]).unwrap();
        let f = mgr.or(ab, v[2]).unwrap();
        let vars = set(&[v[1]]);
        let once = equant(&mut mgr, &set(&[f]), &vars).unwrap()[&f];
        let twice = equant(&mut mgr, &set(&[once]), &vars).unwrap()[&once];
        assert_eq!(once, twice);
    }

    #[test]
    fn uquant_via_double_negation() {
        let (mut mgr, v) = mgr_with_vars(2);
        let f = mgr.and(v[0], v[1]).unwrap();
        // ∀x0. f == ¬∃x0. ¬f == zero for an AND.
        let q = equant(&mut mgr, &set(&[f.negate()]), &set(&[v[0]])).unwrap();
        assert_eq!(q[&f.negate()].negate(), Ref::ZERO);
    }

    #[test]
    fn shift_renames_variables() {
        let (mut mgr, v) = mgr_with_vars(4);
        let f = mgr.and(v[0], v[1]).unwrap();
        let mut vmap = HashMap::new();
        vmap.insert(v[0].var_index(), v[2].var_index());
        vmap.insert(v[1].var_index(), v[3].var_index());
        let shifted = shift(&mut mgr, &set(&[f]), &vmap).unwrap()[&f];
        let expect = mgr.and(v[2], v[3]).unwrap();
        assert_eq!(shifted, expect);
    }

    #[test]
    fn reach_marks_absolute_nodes() {
        let (mut mgr, v) = mgr_with_vars(3);
        let ab = mgr.and(v[0], v[1]).unwrap();
        let f = mgr.or(ab, v[2]).unwrap();
        let marks = reach(&mut mgr, &set(&[f])).unwrap();
        assert!(marks.contains(&f.absval()));
        // Marks are absolute and never constants; interior variable
        // refs are marked along with function nodes.
        for m in &marks {
            assert!(!m.is_neg());
            assert!(!m.is_const());
        }
    }
}
