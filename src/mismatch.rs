//! Bounded-substitution lookup.
//!
//! `hash` is linear over XOR, so the bucket of a mer carrying substitution
//! pattern `e` is `hash(mer) ^ hash(e)`. The matcher enumerates every pattern
//! of up to `n` substituted bases once, keeps the distinct hashed patterns, and
//! at query time probes those buckets. Each candidate is rebuilt to its full mer
//! and accepted only if it really is within the mismatch budget.

use std::collections::HashSet;

use rayon::prelude::*;

use crate::codec::KeyCodec;
use crate::encode::base_mismatches;
use crate::index::PositionDb;

/// Pattern enumeration is allowed at least this many patterns regardless of
/// corpus size.
pub const PATTERN_BUDGET_FLOOR: u64 = 1 << 16;

#[derive(Clone, Debug)]
pub struct MismatchMatcher {
    errors_allowed: u32,
    /// `levels[d]`: hashed patterns first reached with `d` substitutions.
    levels: Vec<Vec<u64>>,
}

impl Default for MismatchMatcher {
    fn default() -> Self {
        Self::exact()
    }
}

impl MismatchMatcher {
    /// Matcher that only probes the mer's own bucket.
    pub fn exact() -> Self {
        Self {
            errors_allowed: 0,
            levels: vec![vec![0]],
        }
    }

    /// Enumerate patterns for up to `n_errors` substitutions, reduced to
    /// [`supported_errors`](Self::supported_errors) when the full enumeration
    /// would exceed the pattern budget for `approx_mers`.
    pub fn new(codec: &KeyCodec, mer_size: u32, n_errors: u32, approx_mers: u64) -> Self {
        let n = Self::supported_errors(mer_size, n_errors, approx_mers);
        if n < n_errors {
            log::warn!(
                "mismatch budget reduced from {n_errors} to {n}: {} patterns exceed the budget of {}",
                Self::pattern_count(mer_size, n_errors),
                Self::pattern_budget(approx_mers)
            );
        }

        let table = codec.table_entries();
        let mut seen: HashSet<u64> = HashSet::new();
        seen.insert(0);
        let mut levels = vec![vec![0u64]];
        for d in 1..=n {
            let mut level = Vec::new();
            // every bucket already reachable: deeper levels add nothing
            if seen.len() as u64 >= table {
                levels.push(level);
                continue;
            }
            walk_patterns(mer_size, d, 0, 0, &mut |e| {
                let h = codec.hash(e);
                if seen.insert(h) {
                    level.push(h);
                }
            });
            level.sort_unstable();
            levels.push(level);
        }

        log::debug!(
            "mismatch matcher: {n} errors, {} probe buckets of {table}",
            seen.len()
        );
        Self {
            errors_allowed: n,
            levels,
        }
    }

    /// Number of substitution patterns with at most `d` substituted bases,
    /// `sum C(mer_size, i) * 3^i`, saturating.
    pub fn pattern_count(mer_size: u32, d: u32) -> u64 {
        let mut total = 0u64;
        let mut choose = 1u64; // C(mer_size, i)
        let mut pow3 = 1u64;
        for i in 0..=d.min(mer_size) {
            if i > 0 {
                choose = choose.saturating_mul((mer_size - i + 1) as u64) / i as u64;
                pow3 = pow3.saturating_mul(3);
            }
            total = total.saturating_add(choose.saturating_mul(pow3));
        }
        total
    }

    pub fn pattern_budget(approx_mers: u64) -> u64 {
        approx_mers.max(PATTERN_BUDGET_FLOOR)
    }

    /// Largest `d <= wanted` whose enumeration fits the pattern budget.
    pub fn supported_errors(mer_size: u32, wanted: u32, approx_mers: u64) -> u32 {
        let budget = Self::pattern_budget(approx_mers);
        let mut d = wanted.min(mer_size);
        while d > 0 && Self::pattern_count(mer_size, d) > budget {
            d -= 1;
        }
        d
    }

    #[inline]
    pub fn errors_allowed(&self) -> u32 {
        self.errors_allowed
    }

    /// Buckets probed for a query with up to `m` mismatches.
    pub fn probe_count(&self, m: u32) -> usize {
        self.probes(m).count()
    }

    /// Hashed patterns for up to `m` substitutions (capped at the prepared budget).
    pub fn probes(&self, m: u32) -> impl Iterator<Item = u64> + '_ {
        let depth = m.min(self.errors_allowed) as usize;
        self.levels[..=depth].iter().flatten().copied()
    }
}

/// Call `f` with every pattern of exactly `d` substituted bases at positions
/// `from..mer_size`, XORed onto `acc`.
fn walk_patterns(mer_size: u32, d: u32, from: u32, acc: u64, f: &mut impl FnMut(u64)) {
    if d == 0 {
        f(acc);
        return;
    }
    for p in from..mer_size {
        for v in 1..=3u64 {
            walk_patterns(mer_size, d - 1, p + 1, acc ^ (v << (2 * p)), f);
        }
    }
}

impl PositionDb {
    /// Positions of every stored mer within `max_mismatches` substituted bases
    /// of `mer` (clamped to the budget the index was prepared for). `posn` is
    /// cleared first; returns whether anything matched.
    pub fn get_up_to_n_mismatches(&self, mer: u64, max_mismatches: u32, posn: &mut Vec<u64>) -> bool {
        posn.clear();
        if !self.data_loaded || mer > self.codec.mer_mask() {
            return false;
        }
        let m = max_mismatches.min(self.matcher.errors_allowed());
        let h = self.codec.hash(mer);
        let mut found = false;
        for p in self.matcher.probes(m) {
            let b = h ^ p;
            let (lo, hi) = self.bucket_range(b);
            for i in lo..hi {
                let e = self.entries.get(i);
                let candidate = self.codec.rebuild(b, self.entry_check(e));
                if base_mismatches(candidate, mer) <= m {
                    self.load_positions(e, posn);
                    found = true;
                }
            }
        }
        found
    }

    /// [`get_up_to_n_mismatches`](Self::get_up_to_n_mismatches) for a batch,
    /// fanned out over the rayon pool; each lookup owns its output buffer.
    pub fn par_get_up_to_n_mismatches(&self, mers: &[u64], max_mismatches: u32) -> Vec<Vec<u64>> {
        mers.par_iter()
            .map(|&mer| {
                let mut posn = Vec::new();
                self.get_up_to_n_mismatches(mer, max_mismatches, &mut posn);
                posn
            })
            .collect()
    }
}
