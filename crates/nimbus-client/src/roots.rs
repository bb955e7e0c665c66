//! Named roots and reference counts.
//!
//! Names map to refs; variables also get a reverse entry so support
//! sets can be printed by name. Reference counts are kept per absolute
//! ref and saturate at 2^20 — a saturated count never decays, which is
//! how `zero` and `one` stay permanent.

use std::collections::{HashMap, HashSet};

use nimbus_bdd::refs::Ref;

/// Saturation value for reference counts.
pub const SAT_COUNT: u32 = 1 << 20;

pub struct RootTable {
    names: HashMap<String, Ref>,
    /// Reverse lookup for variables only.
    var_names: HashMap<Ref, String>,
    counts: HashMap<Ref, u32>,
}

impl Default for RootTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RootTable {
    pub fn new() -> Self {
        let mut table = RootTable {
            names: HashMap::new(),
            var_names: HashMap::new(),
            counts: HashMap::new(),
        };
        // Permanent constants.
        table.counts.insert(Ref::ONE, SAT_COUNT);
        table.names.insert("zero".to_string(), Ref::ZERO);
        table.names.insert("one".to_string(), Ref::ONE);
        table
    }

    pub fn addref(&mut self, r: Ref) {
        if r.is_invalid() {
            return;
        }
        let count = self.counts.entry(r.absval()).or_insert(0);
        if *count < SAT_COUNT {
            *count += 1;
        }
    }

    pub fn deref(&mut self, r: Ref) {
        if r.is_invalid() {
            return;
        }
        let ar = r.absval();
        match self.counts.get_mut(&ar) {
            Some(count) if *count >= SAT_COUNT => {}
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.counts.remove(&ar);
            }
            None => {
                tracing::warn!(%ar, "dereference of untracked root");
            }
        }
    }

    /// Bind `name` to `r`. Rebinding drops the old value and its
    /// negated companion entry. Variables refuse rebinding.
    pub fn assign(&mut self, name: &str, r: Ref, variable: bool) {
        if let Some(&old) = self.names.get(name) {
            if self.var_names.get(&old).map(String::as_str) == Some(name) {
                tracing::warn!(name, "attempt to redefine variable, ignored");
                return;
            }
        }
        self.addref(r);
        if let Some(old) = self.names.remove(name) {
            self.deref(old);
            if !name.starts_with('!') {
                if let Some(old_neg) = self.names.remove(&format!("!{name}")) {
                    self.deref(old_neg);
                }
            }
        }
        self.names.insert(name.to_string(), r);
        if variable {
            self.addref(r);
            self.var_names.insert(r, name.to_string());
        }
    }

    /// Resolve a name; `!name` negates the binding of `name`.
    pub fn get(&self, name: &str) -> Option<Ref> {
        if let Some(&r) = self.names.get(name) {
            return Some(r);
        }
        name.strip_prefix('!')
            .and_then(|base| self.names.get(base))
            .map(|&r| r.negate())
    }

    pub fn delete(&mut self, name: &str) -> bool {
        let Some(r) = self.names.remove(name) else {
            return false;
        };
        self.deref(r);
        if let Some(neg) = self.names.remove(&format!("!{name}")) {
            self.deref(neg);
        }
        self.var_names.remove(&r);
        true
    }

    pub fn variable_name(&self, r: Ref) -> Option<&str> {
        self.var_names.get(&r).map(String::as_str)
    }

    /// Every live function root, by absolute ref — the mark roots for
    /// garbage collection.
    pub fn function_roots(&self) -> HashSet<Ref> {
        self.counts
            .keys()
            .copied()
            .filter(|r| r.is_fun())
            .collect()
    }

    /// Drop everything except the permanent constants.
    pub fn reset(&mut self) {
        *self = RootTable::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_preinstalled() {
        let table = RootTable::new();
        assert_eq!(table.get("zero"), Some(Ref::ZERO));
        assert_eq!(table.get("one"), Some(Ref::ONE));
        assert_eq!(table.get("!zero"), Some(Ref::ONE));
    }

    #[test]
    fn negated_lookup_without_entry() {
        let mut table = RootTable::new();
        let f = Ref::function(0, 7, 1);
        table.assign("f", f, false);
        assert_eq!(table.get("!f"), Some(f.negate()));
        assert_eq!(table.get("!missing"), None);
    }

    #[test]
    fn rebinding_drops_old_count() {
        let mut table = RootTable::new();
        let a = Ref::function(0, 1, 1);
        let b = Ref::function(0, 2, 1);
        table.assign("f", a, false);
        table.assign("f", b, false);
        assert_eq!(table.get("f"), Some(b));
        assert!(!table.function_roots().contains(&a));
        assert!(table.function_roots().contains(&b));
    }

    #[test]
    fn variables_refuse_redefinition() {
        let mut table = RootTable::new();
        let v = Ref::variable(0);
        table.assign("x", v, true);
        table.assign("x", Ref::variable(1), true);
        assert_eq!(table.get("x"), Some(v));
        assert_eq!(table.variable_name(v), Some("x"));
    }

    #[test]
    fn counts_saturate() {
        let mut table = RootTable::new();
        let f = Ref::function(0, 3, 1);
        for _ in 0..(SAT_COUNT + 10) {
            table.addref(f);
        }
        table.deref(f);
        // Saturated counts never drop the entry.
        assert!(table.counts.contains_key(&f));
        assert_eq!(table.counts[&f], SAT_COUNT);
    }

    #[test]
    fn delete_removes_both_polarities() {
        let mut table = RootTable::new();
        let f = Ref::function(0, 4, 1);
        table.assign("g", f, false);
        table.assign("!g", f.negate(), false);
        assert!(table.delete("g"));
        assert_eq!(table.get("g"), None);
        assert_eq!(table.get("!g"), None);
        assert!(!table.delete("g"));
    }

    #[test]
    fn function_roots_ignores_variables_and_constants() {
        let mut table = RootTable::new();
        table.assign("x", Ref::variable(0), true);
        let f = Ref::function(0, 9, 2);
        table.assign("f", f.negate(), false);
        let roots = table.function_roots();
        assert_eq!(roots.len(), 1);
        // Stored by absolute value.
        assert!(roots.contains(&f));
    }
}
