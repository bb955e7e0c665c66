//! Statistic counter indices and their report names.
//!
//! The first block is maintained by the dataflow agent, the rest by the
//! BDD engine. A worker's flush reply carries all of them in index
//! order; the controller folds per-worker values into min/max/sum and
//! the requesting client prints them against `STAT_NAMES`.

pub const STAT_TABLE_BYTE_PEAK: usize = 0;
pub const STAT_OPS_TOTAL: usize = 1;
pub const STAT_OPS_LOCAL: usize = 2;
pub const STAT_OPERANDS_TOTAL: usize = 3;
pub const STAT_OPERANDS_LOCAL: usize = 4;

/// Number of agent-level counters.
pub const NSTAT_AGENT: usize = 5;

pub const STAT_UNIQ_CURR: usize = 5;
pub const STAT_UNIQ_PEAK: usize = 6;
pub const STAT_UNIQ_TOTAL: usize = 7;
pub const STAT_UNIQ_COLLIDE: usize = 8;
pub const STAT_ITE_CNT: usize = 9;
pub const STAT_ITE_LOCAL_CNT: usize = 10;
pub const STAT_ITE_HIT_CNT: usize = 11;
pub const STAT_ITE_NEW_CNT: usize = 12;
pub const STAT_ITEC_CURR: usize = 13;
pub const STAT_ITEC_PEAK: usize = 14;
pub const STAT_ITEC_TOTAL: usize = 15;
pub const STAT_UOP_CNT: usize = 16;
pub const STAT_UOP_HIT_CNT: usize = 17;
pub const STAT_UOP_STORE_CNT: usize = 18;

/// Total counters in a worker STAT message.
pub const NSTAT: usize = 19;

pub const STAT_NAMES: [&str; NSTAT] = [
    "Peak table bytes      ",
    "Total operations sent ",
    "Total local operations",
    "Total operands   sent ",
    "Total local operands  ",
    "Current unique entries",
    "Peak unique entries   ",
    "Total unique entries  ",
    "Unique hash collisions",
    "Total number of ITEs  ",
    "ITEs handled locally  ",
    "ITEs found in cache   ",
    "ITEs causing recursion",
    "Current ITEc entries  ",
    "Peak ITEc entries     ",
    "Total ITEc entries    ",
    "Unary ops executed    ",
    "Unary memo hits       ",
    "Unary values stored   ",
];

/// Aggregated (min, max, sum) triples as laid out in the controller's
/// summary STAT chunk: `1 + 3*i + {0,1,2}`.
pub fn summary_triple(words: &[u64], i: usize) -> Option<(u64, u64, u64)> {
    let base = 1 + 3 * i;
    Some((
        *words.get(base)?,
        *words.get(base + 1)?,
        *words.get(base + 2)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_cover_every_counter() {
        assert_eq!(STAT_NAMES.len(), NSTAT);
        assert_eq!(STAT_UOP_STORE_CNT + 1, NSTAT);
    }

    #[test]
    fn summary_triple_indexes_past_header() {
        let mut words = vec![0u64; 1 + 3 * NSTAT];
        words[1 + 3 * 2] = 7;
        words[1 + 3 * 2 + 1] = 9;
        words[1 + 3 * 2 + 2] = 16;
        assert_eq!(summary_triple(&words, 2), Some((7, 9, 16)));
        assert_eq!(summary_triple(&words, NSTAT - 1), Some((0, 0, 0)));
        assert_eq!(summary_triple(&words, NSTAT), None);
    }
}
