//! Two-pass counting-sort build.
//!
//! 1. size the table from the source's approximate length and the memory ceiling
//! 2. count mers per bucket, prefix-sum into bucket offsets
//! 3. replay the source, dropping `(check, position)` words into their buckets
//! 4. sort each bucket and repack equal-check runs into entries + position lists

use crate::bits::{BitPackedArray, bit_width, low_mask};
use crate::codec::{KeyCodec, MAX_MER_SIZE};
use crate::index::{IndexError, MerCounts, PositionDb, Widths};
use crate::mismatch::MismatchMatcher;
use crate::radix::radix_sort_u64;
use crate::stream::{CountAuthority, KeySet, KeySource, MerPosition};

/// Largest table accepted, in address bits.
pub const MAX_TABLE_BITS: u32 = 40;

/// Build-time configuration.
#[derive(Clone, Copy)]
pub struct BuildConfig<'a> {
    mer_skip: u32,
    mask: Option<&'a dyn KeySet>,
    only: Option<&'a dyn KeySet>,
    counts: Option<&'a dyn CountAuthority>,
    min_count: u64,
    max_count: u64,
    max_mismatch: u32,
    max_memory_mb: u64,
    table_bits: Option<u32>,
    verbose: bool,
}

impl Default for BuildConfig<'_> {
    fn default() -> Self {
        Self {
            mer_skip: 0,
            mask: None,
            only: None,
            counts: None,
            min_count: 0,
            max_count: u64::MAX,
            max_mismatch: 0,
            max_memory_mb: 0,
            table_bits: None,
            verbose: false,
        }
    }
}

impl<'a> BuildConfig<'a> {
    /// Keep one mer, then skip `n`, repeat (default: 0, keep all).
    pub fn mer_skip(mut self, n: u32) -> Self {
        self.mer_skip = n;
        self
    }
    /// Drop every mer contained in `set`.
    pub fn mask(mut self, set: &'a dyn KeySet) -> Self {
        self.mask = Some(set);
        self
    }
    /// Keep only mers contained in `set`.
    pub fn only(mut self, set: &'a dyn KeySet) -> Self {
        self.only = Some(set);
        self
    }
    /// Take counts from `authority` instead of counting occurrences.
    pub fn counts(mut self, authority: &'a dyn CountAuthority) -> Self {
        self.counts = Some(authority);
        self
    }
    /// Drop mers counted fewer than `n` times.
    pub fn min_count(mut self, n: u64) -> Self {
        self.min_count = n;
        self
    }
    /// Drop mers counted more than `n` times.
    pub fn max_count(mut self, n: u64) -> Self {
        self.max_count = n;
        self
    }
    /// Prepare mismatch lookups with up to `n` substitutions.
    pub fn max_mismatch(mut self, n: u32) -> Self {
        self.max_mismatch = n;
        self
    }
    /// Memory ceiling for table sizing, in MiB (0 = unlimited).
    pub fn max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }
    /// Use a `2^bits` table instead of sizing automatically.
    pub fn table_bits(mut self, bits: u32) -> Self {
        self.table_bits = Some(bits);
        self
    }
    /// Log sizing and progress at info level.
    pub fn verbose(mut self, yes: bool) -> Self {
        self.verbose = yes;
        self
    }

    #[inline]
    fn keeps(&self, mer: u64) -> bool {
        if self.mask.is_some_and(|m| m.contains_key(mer)) {
            return false;
        }
        self.only.is_none_or(|o| o.contains_key(mer))
    }
}

/// Table geometry chosen before any bulk allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizingPlan {
    pub table_bits: u32,
    /// Mismatch budget after any reduction.
    pub max_mismatch: u32,
    /// Estimated footprint in bytes.
    pub estimated_bytes: u64,
}

/// Widest entry value a build over `approx_mers` mers can produce: the
/// largest position (skipped mers still advance it) or a pointer into lists
/// of at most `header + 1` slots per mer.
fn value_width(approx_mers: u64, cfg: &BuildConfig<'_>) -> u32 {
    let positions = approx_mers.saturating_mul(cfg.mer_skip as u64 + 1);
    let slots_per_mer = if cfg.counts.is_some() { 3 } else { 2 };
    bit_width(positions).max(bit_width(approx_mers.saturating_mul(slots_per_mer)))
}

/// Smallest table that keeps `[unique | check | value]` in one word.
#[inline]
fn min_table_bits(mer_bits: u32, value: u32) -> u32 {
    (mer_bits + value + 1).saturating_sub(64).max(1)
}

/// Rough footprint of a `2^t` table: bucket offsets plus one entry per mer.
fn estimate_bytes(mer_bits: u32, t: u32, approx_mers: u64, value: u32) -> u64 {
    let hash = bit_width(approx_mers) as u64;
    let table = (1u64 << t).saturating_mul(hash);
    let per_mer = (mer_bits - t) as u64 + 1 + value as u64;
    table.saturating_add(approx_mers.saturating_mul(per_mer)) / 8
}

#[inline]
fn to_mb(bytes: u64) -> u64 {
    bytes.div_ceil(1 << 20)
}

fn check_ceiling(estimated_bytes: u64, cfg: &BuildConfig<'_>) -> Result<(), IndexError> {
    if cfg.max_memory_mb > 0 && to_mb(estimated_bytes) > cfg.max_memory_mb {
        return Err(IndexError::Capacity {
            limit_mb: cfg.max_memory_mb,
            needed_mb: to_mb(estimated_bytes),
        });
    }
    Ok(())
}

/// Largest automatic table for `mer_bits`-bit mers.
#[inline]
fn max_auto_table_bits(mer_bits: u32) -> u32 {
    (if mer_bits >= 8 { mer_bits - 4 } else { mer_bits - 2 }).min(MAX_TABLE_BITS)
}

/// Pick the table size and mismatch budget for `approx_mers` mers.
pub fn plan_table(
    mer_size: u32,
    approx_mers: u64,
    cfg: &BuildConfig<'_>,
) -> Result<SizingPlan, IndexError> {
    if mer_size < 2 || mer_size > MAX_MER_SIZE {
        return Err(IndexError::Parameter(format!(
            "mer size {mer_size} outside 2..={MAX_MER_SIZE}"
        )));
    }
    let mer_bits = 2 * mer_size;
    let max_mismatch = MismatchMatcher::supported_errors(mer_size, cfg.max_mismatch, approx_mers);
    if max_mismatch < cfg.max_mismatch {
        log::warn!(
            "{mer_size}-mers over ~{approx_mers} mers support at most {max_mismatch} mismatches (asked for {})",
            cfg.max_mismatch
        );
    }
    let value = value_width(approx_mers, cfg);

    let plan = match cfg.table_bits {
        Some(t) => {
            if t > MAX_TABLE_BITS {
                return Err(IndexError::Parameter(format!(
                    "table of {t} bits exceeds the {MAX_TABLE_BITS}-bit limit"
                )));
            }
            KeyCodec::new(mer_size, t)?;
            SizingPlan {
                table_bits: t,
                max_mismatch,
                estimated_bytes: estimate_bytes(mer_bits, t, approx_mers, value),
            }
        }
        None => {
            let lo = min_table_bits(mer_bits, value);
            let hi = max_auto_table_bits(mer_bits);
            if lo > hi {
                return Err(IndexError::Parameter(format!(
                    "~{approx_mers} mers is too many for {mer_size}-mers (table bits {lo} > {hi})"
                )));
            }
            let mut best: Option<SizingPlan> = None;
            for t in lo..=hi {
                let bytes = estimate_bytes(mer_bits, t, approx_mers, value);
                progress!(
                    cfg.verbose,
                    "  tableBits={t:2} chckBits={:2} ~{} MiB",
                    mer_bits - t,
                    to_mb(bytes)
                );
                if best.is_none_or(|b| bytes < b.estimated_bytes) {
                    best = Some(SizingPlan {
                        table_bits: t,
                        max_mismatch,
                        estimated_bytes: bytes,
                    });
                }
            }
            let Some(best) = best else {
                return Err(IndexError::Parameter(format!(
                    "no table size available for {mer_size}-mers"
                )));
            };
            best
        }
    };
    check_ceiling(plan.estimated_bytes, cfg)?;
    Ok(plan)
}

/// Build a position index over every mer of `source`.
///
/// `source` is consumed twice and must replay identically. Any failure aborts
/// the build; no partial index is returned.
pub fn build_position_db<S: KeySource + ?Sized>(
    source: &S,
    mer_size: u32,
    cfg: &BuildConfig<'_>,
) -> Result<PositionDb, IndexError> {
    let approx = source.approximate_len() / (cfg.mer_skip as u64 + 1);
    let plan = plan_table(mer_size, approx, cfg)?;
    progress!(
        cfg.verbose,
        "[posdb] {mer_size}-mers, ~{approx} mers: tableBits={} (~{} MiB), maxMismatch={}",
        plan.table_bits,
        to_mb(plan.estimated_bytes),
        plan.max_mismatch
    );

    let step = cfg.mer_skip as usize + 1;
    let stream = || {
        source
            .keys()
            .step_by(step)
            .filter(|mp: &MerPosition| cfg.keeps(mp.mer))
    };
    let has_counts = cfg.counts.is_some();
    let header = if has_counts { 2 } else { 1 };

    // ---- Count pass ----
    // A source that under-reports its length can outgrow the planned table;
    // recount once with a table large enough for what was actually seen.
    let mut table_bits = plan.table_bits;
    let (codec, bucket_sizes, n_mers, max_pos) = loop {
        let codec = KeyCodec::new(mer_size, table_bits)?;
        let (sizes, n, max_pos) = count_pass(stream(), &codec)?;
        let value = bit_width(max_pos).max(bit_width(n.saturating_mul(header + 1)));
        let needed = min_table_bits(codec.mer_bits(), value);
        if needed <= table_bits {
            break (codec, sizes, n, max_pos);
        }
        if cfg.table_bits.is_some() || needed > max_auto_table_bits(codec.mer_bits()) {
            return Err(IndexError::Parameter(format!(
                "{n} mers up to position {max_pos} need a table of at least {needed} bits (have {table_bits})"
            )));
        }
        check_ceiling(estimate_bytes(codec.mer_bits(), needed, n, value), cfg)?;
        log::warn!("source held {n} mers (~{approx} expected); resizing to tableBits={needed}");
        table_bits = needed;
    };
    let table = codec.table_entries() as usize;
    progress!(cfg.verbose, "[posdb] counted {n_mers} mers, largest position {max_pos}");

    let chck = codec.check_width();
    let posn = bit_width(max_pos);
    let word_bits = chck + posn;
    if word_bits > 64 {
        return Err(IndexError::Parameter(format!(
            "check ({chck} bits) plus position ({posn} bits) exceeds 64 bits"
        )));
    }

    // ---- Offsets ----
    let mut starts = Vec::with_capacity(table + 1);
    let mut sum = 0u64;
    for &s in &bucket_sizes {
        starts.push(sum);
        sum += s;
    }
    starts.push(sum);
    drop(bucket_sizes);

    // ---- Fill pass ----
    let mut counting = BitPackedArray::new(word_bits, n_mers);
    let mut cursor = starts[..table].to_vec();
    let mut filled = 0u64;
    for mp in stream() {
        if mp.mer > codec.mer_mask() || mp.position > max_pos {
            return Err(IndexError::Replay(format!(
                "mer {:#x} at {} not seen on the count pass",
                mp.mer, mp.position
            )));
        }
        let h = codec.hash(mp.mer) as usize;
        if cursor[h] >= starts[h + 1] {
            return Err(IndexError::Replay(format!("bucket {h} overflowed on the fill pass")));
        }
        counting.set(cursor[h], (codec.check(mp.mer) << posn) | mp.position);
        cursor[h] += 1;
        filled += 1;
    }
    if filled != n_mers {
        return Err(IndexError::Replay(format!(
            "fill pass saw {filled} mers, count pass saw {n_mers}"
        )));
    }
    drop(cursor);

    // ---- Repack: sort buckets, size the final arrays ----
    let posn_mask = low_mask(posn);
    let mut scratch = Vec::new();
    let mut bucket = Vec::new();
    let mut kept = 0u64;
    let mut list_slots = 0u64;
    let mut max_list_value = 0u64;

    for b in 0..table {
        let (s, e) = (starts[b], starts[b + 1]);
        if s == e {
            continue;
        }
        bucket.clear();
        bucket.extend((s..e).map(|i| counting.get(i)));
        radix_sort_u64(&mut bucket, word_bits, &mut scratch);
        for (i, &w) in bucket.iter().enumerate() {
            counting.set(s + i as u64, w);
        }
        for run in bucket.chunk_by(|a, b| a >> posn == b >> posn) {
            let len = run.len() as u64;
            let count = run_count(&codec, cfg, b as u64, run[0] >> posn, len);
            if count < cfg.min_count || count > cfg.max_count {
                continue;
            }
            kept += 1;
            if has_counts || len > 1 {
                list_slots += header + len;
                max_list_value = max_list_value.max(len).max(count);
            }
        }
    }

    let widths = Widths {
        hash: bit_width(kept),
        chck,
        posn,
        pptr: bit_width(list_slots),
        list: posn.max(bit_width(max_list_value)),
    };
    if widths.entry() > 64 {
        return Err(IndexError::Parameter(format!(
            "entry needs {} bits (check {chck}, value {}); use a larger table",
            widths.entry(),
            widths.value()
        )));
    }

    let mut db = PositionDb {
        mer_size,
        mer_skip: cfg.mer_skip,
        codec,
        widths,
        has_counts,
        offsets: BitPackedArray::new(widths.hash, table as u64 + 1),
        entries: BitPackedArray::new(widths.entry(), kept),
        positions: BitPackedArray::new(widths.list, list_slots),
        data_loaded: true,
        counts: MerCounts::default(),
        approx_mers: approx,
        matcher: MismatchMatcher::exact(),
    };

    // ---- Repack: emit entries and lists ----
    let mut counts = MerCounts {
        positions: if n_mers > 0 { max_pos + 1 } else { 0 },
        ..MerCounts::default()
    };
    let mut w_entry = 0u64;
    let mut w_pos = 0u64;
    for b in 0..table {
        db.offsets.set(b as u64, w_entry);
        let (s, e) = (starts[b], starts[b + 1]);
        if s == e {
            continue;
        }
        bucket.clear();
        bucket.extend((s..e).map(|i| counting.get(i)));
        for run in bucket.chunk_by(|a, b| a >> posn == b >> posn) {
            let check = run[0] >> posn;
            let len = run.len() as u64;
            let count = run_count(&db.codec, cfg, b as u64, check, len);
            if count < cfg.min_count || count > cfg.max_count {
                continue;
            }
            let entry = if !has_counts && len == 1 {
                db.pack_entry(true, check, run[0] & posn_mask)
            } else {
                db.positions.set(w_pos, len);
                if has_counts {
                    db.positions.set(w_pos + 1, count);
                }
                for (j, &w) in run.iter().enumerate() {
                    db.positions.set(w_pos + header + j as u64, w & posn_mask);
                }
                let entry = db.pack_entry(false, check, w_pos);
                w_pos += header + len;
                entry
            };
            db.entries.set(w_entry, entry);
            w_entry += 1;

            counts.mers += len;
            counts.distinct += 1;
            if count == 1 {
                counts.unique += 1;
            }
        }
    }
    db.offsets.set(table as u64, w_entry);
    debug_assert_eq!(w_entry, kept);
    debug_assert_eq!(w_pos, list_slots);
    counts.entries = w_entry;
    db.counts = counts;
    drop(counting);

    progress!(
        cfg.verbose,
        "[posdb] {} distinct, {} unique, {} retained of {n_mers} mers; {} bytes packed",
        counts.distinct,
        counts.unique,
        counts.mers,
        db.memory_bytes()
    );

    if plan.max_mismatch > 0 {
        db.matcher = MismatchMatcher::new(&db.codec, mer_size, plan.max_mismatch, approx);
    }
    Ok(db)
}

/// Bucket sizes, mer count and largest position of one pass over `keys`.
fn count_pass(
    keys: impl Iterator<Item = MerPosition>,
    codec: &KeyCodec,
) -> Result<(Vec<u64>, u64, u64), IndexError> {
    let mut bucket_sizes = vec![0u64; codec.table_entries() as usize];
    let mut n_mers = 0u64;
    let mut max_pos = 0u64;
    for mp in keys {
        if mp.mer > codec.mer_mask() {
            return Err(IndexError::Parameter(format!(
                "mer {:#x} wider than {} bits",
                mp.mer,
                codec.mer_bits()
            )));
        }
        bucket_sizes[codec.hash(mp.mer) as usize] += 1;
        n_mers += 1;
        max_pos = max_pos.max(mp.position);
    }
    Ok((bucket_sizes, n_mers, max_pos))
}

impl PositionDb {
    /// Same as [`build_position_db`].
    pub fn build<S: KeySource + ?Sized>(
        source: &S,
        mer_size: u32,
        cfg: &BuildConfig<'_>,
    ) -> Result<Self, IndexError> {
        build_position_db(source, mer_size, cfg)
    }
}

/// Count used for thresholds: the authority's when it knows the mer, else the
/// number of occurrences.
#[inline]
fn run_count(codec: &KeyCodec, cfg: &BuildConfig<'_>, bucket: u64, check: u64, len: u64) -> u64 {
    match cfg.counts {
        Some(authority) => authority.count(codec.rebuild(bucket, check)).unwrap_or(len),
        None => len,
    }
}
