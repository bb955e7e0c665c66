//! Conjunction of many terms with abort-and-retry heuristics.
//!
//! Pairs of arguments are ranked by size-weighted support similarity;
//! the best candidates are tried with a size-bounded AND whose limit
//! grows by `expansion_factor` each pass, and the final try is
//! unbounded so progress is guaranteed. Each accepted combination is
//! then offered soft-AND simplification against the rest of the set.
//!
//! The engine is a trait so the heuristics run identically against the
//! distributed session and the in-process manager.

use nimbus_bdd::refs::Ref;
use nimbus_core::config::ConjunctConfig;

/// The three primitives the heuristics need from a BDD engine.
pub trait ConjunctEngine {
    type Error;

    async fn and(&mut self, a: Ref, b: Ref) -> Result<Ref, Self::Error>;

    /// Node count of the function's diagram.
    async fn size(&mut self, r: Ref) -> Result<usize, Self::Error>;

    /// Sorted variable indices in the function's support.
    async fn support_vars(&mut self, r: Ref) -> Result<Vec<u16>, Self::Error>;
}

/// What a finished conjunction reports.
#[derive(Debug, Clone)]
pub struct ConjunctOutcome {
    pub result: Ref,
    pub arguments: usize,
    pub aborts: usize,
    pub result_size: usize,
    pub max_argument_size: usize,
    pub max_size_limit: usize,
}

/// One term of the set, with lazily-filled metadata.
struct Term {
    fun: Ref,
    size: Option<usize>,
    support: Option<Vec<u16>>,
}

impl Term {
    fn new(fun: Ref) -> Self {
        Term {
            fun,
            size: None,
            support: None,
        }
    }
}

/// Jaccard similarity of two sorted index sets.
pub fn index_similarity(a: &[u16], b: &[u16]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = intersection_count(a, b);
    let union = a.len() + b.len() - inter;
    inter as f64 / union as f64
}

/// Fraction of `a`'s indices that also appear in `b`.
pub fn index_coverage(a: &[u16], b: &[u16]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    intersection_count(a, b) as f64 / a.len() as f64
}

fn intersection_count(a: &[u16], b: &[u16]) -> usize {
    let mut count = 0;
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                count += 1;
                i += 1;
                j += 1;
            }
        }
    }
    count
}

/// Similarity discount for large arguments: zero at the smallest
/// argument in the set, `max_large_argument_penalty` at the largest,
/// linear in log size between them.
fn size_weight(cfg: &ConjunctConfig, size: usize, log_min: f64, log_max: f64) -> f64 {
    if log_max <= log_min {
        return 1.0;
    }
    let lsize = (size.max(1) as f64).log10();
    let frac = ((lsize - log_min) / (log_max - log_min)).clamp(0.0, 1.0);
    1.0 - cfg.max_large_argument_penalty * frac
}

async fn term_size<E: ConjunctEngine>(engine: &mut E, term: &mut Term) -> Result<usize, E::Error> {
    if term.size.is_none() {
        term.size = Some(engine.size(term.fun).await?);
    }
    Ok(term.size.unwrap_or(0))
}

async fn term_support<'t, E: ConjunctEngine>(
    engine: &mut E,
    term: &'t mut Term,
) -> Result<&'t [u16], E::Error> {
    if term.support.is_none() {
        term.support = Some(engine.support_vars(term.fun).await?);
    }
    Ok(term.support.as_deref().unwrap_or(&[]))
}

/// Compute the AND of `args` with the abort-and-retry schedule.
pub async fn conjunct<E: ConjunctEngine>(
    engine: &mut E,
    cfg: &ConjunctConfig,
    args: Vec<Ref>,
) -> Result<ConjunctOutcome, E::Error> {
    let arguments = args.len();
    if args.is_empty() {
        return Ok(ConjunctOutcome {
            result: Ref::ONE,
            arguments,
            aborts: 0,
            result_size: 1,
            max_argument_size: 0,
            max_size_limit: 0,
        });
    }
    let mut terms: Vec<Term> = args.into_iter().map(Term::new).collect();
    let mut aborts = 0usize;
    let mut max_argument_size = 0usize;
    let mut max_size_limit = 0usize;

    while terms.len() > 1 {
        // Size range of the current set, in nodes and in log10.
        let mut max_size = 0usize;
        let mut min_size = usize::MAX;
        for idx in 0..terms.len() {
            let s = term_size(engine, &mut terms[idx]).await?;
            max_size = max_size.max(s);
            min_size = min_size.min(s);
        }
        max_argument_size = max_argument_size.max(max_size);
        let log_min = (min_size.max(1) as f64).log10();
        let log_max = (max_size.max(1) as f64).log10();

        // Rank unordered pairs by weighted support similarity, keeping
        // the best `abort_limit`.
        let mut candidates: Vec<(usize, usize, f64)> = Vec::new();
        for i in 0..terms.len() {
            for j in (i + 1)..terms.len() {
                let sup_i = term_support(engine, &mut terms[i]).await?.to_vec();
                let sup_j = term_support(engine, &mut terms[j]).await?;
                let raw = index_similarity(&sup_i, sup_j);
                let pair_size = terms[i].size.unwrap_or(0).max(terms[j].size.unwrap_or(0));
                let sim = raw * size_weight(cfg, pair_size, log_min, log_max);
                candidates.push((i, j, sim));
            }
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(cfg.abort_limit);
        let ccount = candidates.len().max(1);

        // Try candidates with a growing size bound; the final try is
        // unbounded to guarantee progress.
        let mut size_limit = max_size;
        max_size_limit = max_size_limit.max(size_limit);
        let try_limit = ccount * cfg.pass_limit + 1;
        let mut accepted: Option<(usize, usize, Ref)> = None;
        for try_no in 0..=try_limit {
            let final_try = try_no == try_limit;
            let tidx = try_no % ccount;
            if tidx == 0 && try_no > 0 {
                size_limit = ((size_limit as f64) * cfg.expansion_factor).ceil() as usize;
                max_size_limit = max_size_limit.max(size_limit);
                tracing::debug!(size_limit, "conjunction pass size limit");
            }
            let (i, j, sim) = candidates[tidx];
            let product = engine.and(terms[i].fun, terms[j].fun).await?;
            if !final_try {
                let psize = engine.size(product).await?;
                if psize > size_limit {
                    aborts += 1;
                    tracing::debug!(
                        sim = format_args!("{sim:.3}"),
                        try_no,
                        psize,
                        size_limit,
                        "bounded AND aborted"
                    );
                    continue;
                }
            }
            accepted = Some((i, j, product));
            break;
        }
        // The unbounded final try always succeeds.
        let Some((i, j, product)) = accepted else {
            unreachable!("final conjunction try is unbounded");
        };

        let (lo, hi) = (i.min(j), i.max(j));
        terms.remove(hi);
        terms.remove(lo);
        let mut fresh = Term::new(product);

        // Soft-AND simplification in both directions across the set.
        for idx in 0..terms.len() {
            soft_simplify(engine, cfg, &mut fresh, &mut terms[idx]).await?;
            soft_simplify(engine, cfg, &mut terms[idx], &mut fresh).await?;
        }
        terms.push(fresh);
    }

    let result = terms[0].fun;
    let result_size = engine.size(result).await?;
    tracing::info!(
        arguments,
        aborts,
        result_size,
        max_argument_size,
        max_size_limit,
        "conjunction complete"
    );
    Ok(ConjunctOutcome {
        result,
        arguments,
        aborts,
        result_size,
        max_argument_size,
        max_size_limit,
    })
}

/// Try to simplify `target` by ANDing in `other` when `other`'s support
/// is mostly covered by `target`'s; accept only non-growing results.
async fn soft_simplify<E: ConjunctEngine>(
    engine: &mut E,
    cfg: &ConjunctConfig,
    target: &mut Term,
    other: &mut Term,
) -> Result<(), E::Error> {
    let sup_other = term_support(engine, other).await?.to_vec();
    let sup_target = term_support(engine, target).await?;
    let cov = index_coverage(&sup_other, sup_target);
    if cov < cfg.soft_and_threshold {
        return Ok(());
    }
    let tsize = term_size(engine, target).await?;
    let nval = engine.and(target.fun, other.fun).await?;
    let nsize = engine.size(nval).await?;
    if nsize <= tsize {
        tracing::debug!(cov = format_args!("{cov:.3}"), tsize, nsize, "soft AND accepted");
        *target = Term::new(nval);
        target.size = Some(nsize);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_bdd::mgr::{BddError, RefMgr};
    use nimbus_bdd::uop;
    use std::collections::HashSet;

    struct LocalEngine {
        mgr: RefMgr,
    }

    impl ConjunctEngine for LocalEngine {
        type Error = BddError;

        async fn and(&mut self, a: Ref, b: Ref) -> Result<Ref, BddError> {
            self.mgr.and(a, b)
        }

        async fn size(&mut self, r: Ref) -> Result<usize, BddError> {
            if r.is_const() {
                return Ok(1);
            }
            let roots: HashSet<Ref> = [r].into_iter().collect();
            Ok(uop::reach(&mut self.mgr, &roots)?.len())
        }

        async fn support_vars(&mut self, r: Ref) -> Result<Vec<u16>, BddError> {
            let roots: HashSet<Ref> = [r].into_iter().collect();
            let mut vars: Vec<u16> = uop::support(&mut self.mgr, &roots)?
                .into_iter()
                .map(|v| v.var_index())
                .collect();
            vars.sort_unstable();
            Ok(vars)
        }
    }

    #[test]
    fn similarity_and_coverage() {
        assert!((index_similarity(&[0, 1, 2], &[1, 2, 3]) - 0.5).abs() < 1e-12);
        assert_eq!(index_similarity(&[], &[]), 0.0);
        assert!((index_coverage(&[1, 2], &[0, 1, 2, 3]) - 1.0).abs() < 1e-12);
        assert!((index_coverage(&[1, 4], &[0, 1, 2, 3]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn size_weight_spans_penalty_range() {
        let cfg = ConjunctConfig::default();
        assert!((size_weight(&cfg, 10, 1.0, 3.0) - 1.0).abs() < 1e-12);
        let heavy = size_weight(&cfg, 1000, 1.0, 3.0);
        assert!((heavy - (1.0 - cfg.max_large_argument_penalty)).abs() < 1e-12);
        // Degenerate range applies no penalty.
        assert_eq!(size_weight(&cfg, 500, 2.0, 2.0), 1.0);
    }

    #[tokio::test]
    async fn conjunction_matches_plain_product() {
        let mut engine = LocalEngine { mgr: RefMgr::new() };
        let v: Vec<Ref> = (0..3)
            .map(|_| engine.mgr.new_variable().unwrap())
            .collect();
        let (a, b, c) = (v[0], v[1], v[2]);

        let f1 = engine.mgr.and(a, b).unwrap();
        let f2 = engine.mgr.or(b, c).unwrap();
        let f3 = engine.mgr.or(a.negate(), c).unwrap();
        let f4 = engine.mgr.or(a, c.negate()).unwrap();

        let mut plain = Ref::ONE;
        for f in [f1, f2, f3, f4] {
            plain = engine.mgr.and(plain, f).unwrap();
        }

        let cfg = ConjunctConfig::default();
        let out = conjunct(&mut engine, &cfg, vec![f1, f2, f3, f4])
            .await
            .unwrap();
        assert_eq!(out.result, plain);
        assert_eq!(out.arguments, 4);
    }

    #[tokio::test]
    async fn empty_conjunction_is_one() {
        let mut engine = LocalEngine { mgr: RefMgr::new() };
        let cfg = ConjunctConfig::default();
        let out = conjunct(&mut engine, &cfg, vec![]).await.unwrap();
        assert_eq!(out.result, Ref::ONE);
        assert_eq!(out.aborts, 0);
    }

    #[tokio::test]
    async fn singleton_conjunction_returns_argument() {
        let mut engine = LocalEngine { mgr: RefMgr::new() };
        let x = engine.mgr.new_variable().unwrap();
        let cfg = ConjunctConfig::default();
        let out = conjunct(&mut engine, &cfg, vec![x]).await.unwrap();
        assert_eq!(out.result, x);
    }

    #[tokio::test]
    async fn contradiction_collapses_to_zero() {
        let mut engine = LocalEngine { mgr: RefMgr::new() };
        let x = engine.mgr.new_variable().unwrap();
        let y = engine.mgr.new_variable().unwrap();
        let cfg = ConjunctConfig::default();
        let out = conjunct(&mut engine, &cfg, vec![x, y, x.negate()])
            .await
            .unwrap();
        assert_eq!(out.result, Ref::ZERO);
    }

    #[tokio::test]
    async fn tight_limits_record_aborts_but_stay_correct() {
        let mut engine = LocalEngine { mgr: RefMgr::new() };
        let v: Vec<Ref> = (0..6)
            .map(|_| engine.mgr.new_variable().unwrap())
            .collect();
        // Pairwise XORs share little support, forcing real work.
        let f1 = engine.mgr.xor(v[0], v[3]).unwrap();
        let f2 = engine.mgr.xor(v[1], v[4]).unwrap();
        let f3 = engine.mgr.xor(v[2], v[5]).unwrap();

        let mut plain = Ref::ONE;
        for f in [f1, f2, f3] {
            plain = engine.mgr.and(plain, f).unwrap();
        }

        let cfg = ConjunctConfig {
            expansion_factor: 1.01,
            ..ConjunctConfig::default()
        };
        let out = conjunct(&mut engine, &cfg, vec![f1, f2, f3]).await.unwrap();
        assert_eq!(out.result, plain);
    }
}
