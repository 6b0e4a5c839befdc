//! PositionDb: bit-packed bucket store and the exact query API.
//!
//! Layout
//! - `offsets[b] .. offsets[b + 1]` is bucket `b`'s run in `entries`.
//! - An entry packs `[unique:1 | check:chck_width | value:value_width]`.
//!   `value` is the position itself when `unique` is set, else a pointer into
//!   `positions` where the list `[len, (count,) pos_0 .. pos_len-1]` starts.
//! - Entries in a bucket are sorted by check.

use std::io::Write;

use rayon::prelude::*;
use thiserror::Error;

use crate::bits::{BitPackedArray, low_mask};
use crate::codec::KeyCodec;
use crate::mismatch::MismatchMatcher;

#[derive(Debug, Error)]
/// Errors returned by PositionDb.
pub enum IndexError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid, truncated or mismatched image.
    #[error("Invalid position index image: {0}")]
    Format(String),
    /// Bytemuck cast failed.
    #[error("Cast error: {0}")]
    Cast(String),
    /// Invalid mer size / table size / field width combination.
    #[error("Invalid parameters: {0}")]
    Parameter(String),
    /// No table geometry fits the memory ceiling.
    #[error("Memory ceiling of {limit_mb} MiB too small; smallest configuration needs ~{needed_mb} MiB")]
    Capacity { limit_mb: u64, needed_mb: u64 },
    /// The key source yielded different mers on the fill pass.
    #[error("Key source did not replay identically: {0}")]
    Replay(String),
}

/// Aggregate counters, written during build and `filter` only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MerCounts {
    /// Occurrences retained (sum of list lengths).
    pub mers: u64,
    /// Largest position seen plus one.
    pub positions: u64,
    /// Distinct mers retained.
    pub distinct: u64,
    /// Distinct mers with a count of exactly one.
    pub unique: u64,
    /// Entries in the table (equals `distinct`).
    pub entries: u64,
}

/// Bit widths of the packed fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Widths {
    /// Bucket offsets.
    pub hash: u32,
    pub chck: u32,
    pub posn: u32,
    /// Pointers into the position array.
    pub pptr: u32,
    /// Slots of the position array (positions, lengths, counts).
    pub list: u32,
}

impl Widths {
    #[inline]
    pub fn value(&self) -> u32 {
        self.posn.max(self.pptr)
    }

    #[inline]
    pub fn entry(&self) -> u32 {
        1 + self.chck + self.value()
    }
}

/// K-mer position index: query-time API.
#[derive(Debug)]
pub struct PositionDb {
    pub(crate) mer_size: u32,
    pub(crate) mer_skip: u32,
    pub(crate) codec: KeyCodec,
    pub(crate) widths: Widths,
    /// Lists carry an external count after their length.
    pub(crate) has_counts: bool,
    pub(crate) offsets: BitPackedArray,
    pub(crate) entries: BitPackedArray,
    pub(crate) positions: BitPackedArray,
    /// False for metadata-only loads.
    pub(crate) data_loaded: bool,
    pub(crate) counts: MerCounts,
    /// Approximate mer count the build was sized for.
    pub(crate) approx_mers: u64,
    pub(crate) matcher: MismatchMatcher,
}

impl PositionDb {
    /// K-mer size in bases.
    #[inline]
    pub fn mer_size(&self) -> u32 {
        self.mer_size
    }

    #[inline]
    pub fn mer_skip(&self) -> u32 {
        self.mer_skip
    }

    #[inline]
    pub fn table_bits(&self) -> u32 {
        self.codec.table_bits()
    }

    #[inline]
    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    #[inline]
    pub fn counts(&self) -> MerCounts {
        self.counts
    }

    /// Whether the bulk arrays are present (false after `load_data = false`).
    #[inline]
    pub fn has_data(&self) -> bool {
        self.data_loaded
    }

    /// Mismatch budget the matcher was prepared for.
    #[inline]
    pub fn max_mismatch(&self) -> u32 {
        self.matcher.errors_allowed()
    }

    /// Number of entries in bucket `b`.
    pub fn bucket_size(&self, b: u64) -> u64 {
        if !self.data_loaded || b >= self.codec.table_entries() {
            return 0;
        }
        self.offsets.get(b + 1) - self.offsets.get(b)
    }

    /// Bytes held by the packed arrays.
    pub fn memory_bytes(&self) -> usize {
        self.offsets.bytes() + self.entries.bytes() + self.positions.bytes()
    }

    // -------- Exact queries --------

    /// Fill `posn` with the positions of `mer` and return its count, or
    /// `None` if absent. `posn` is cleared first.
    pub fn get_exact(&self, mer: u64, posn: &mut Vec<u64>) -> Option<u64> {
        posn.clear();
        let e = self.find(mer)?;
        Some(self.load_positions(e, posn))
    }

    pub fn exists_exact(&self, mer: u64) -> bool {
        self.find(mer).is_some()
    }

    /// Count of `mer`, 0 if absent.
    pub fn count_exact(&self, mer: u64) -> u64 {
        self.find(mer).map_or(0, |e| self.entry_count(e))
    }

    /// Counts for a batch of mers, spread over the rayon pool.
    pub fn par_count_exact(&self, mers: &[u64]) -> Vec<u64> {
        mers.par_iter().map(|&m| self.count_exact(m)).collect()
    }

    /// Locate the entry for `mer`.
    pub(crate) fn find(&self, mer: u64) -> Option<u64> {
        if !self.data_loaded || mer > self.codec.mer_mask() {
            return None;
        }
        let h = self.codec.hash(mer);
        let c = self.codec.check(mer);
        let (mut lo, mut hi) = self.bucket_range(h);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let e = self.entries.get(mid);
            let ec = self.entry_check(e);
            if ec < c {
                lo = mid + 1;
            } else if ec > c {
                hi = mid;
            } else {
                return Some(e);
            }
        }
        None
    }

    #[inline]
    pub(crate) fn bucket_range(&self, h: u64) -> (u64, u64) {
        (self.offsets.get(h), self.offsets.get(h + 1))
    }

    // -------- Entry field helpers --------

    #[inline]
    pub(crate) fn pack_entry(&self, unique: bool, check: u64, value: u64) -> u64 {
        let vw = self.widths.value();
        ((unique as u64) << (self.widths.chck + vw)) | (check << vw) | (value & low_mask(vw))
    }

    #[inline]
    pub(crate) fn entry_unique(&self, e: u64) -> bool {
        (e >> (self.widths.chck + self.widths.value())) & 1 == 1
    }

    #[inline]
    pub(crate) fn entry_check(&self, e: u64) -> u64 {
        (e >> self.widths.value()) & low_mask(self.widths.chck)
    }

    #[inline]
    pub(crate) fn entry_value(&self, e: u64) -> u64 {
        e & low_mask(self.widths.value())
    }

    /// Slots taken by a list header.
    #[inline]
    pub(crate) fn header_slots(&self) -> u64 {
        if self.has_counts { 2 } else { 1 }
    }

    /// `(length, count)` of the list behind entry `e`.
    #[inline]
    pub(crate) fn entry_len_count(&self, e: u64) -> (u64, u64) {
        if self.entry_unique(e) {
            return (1, 1);
        }
        let ptr = self.entry_value(e);
        let len = self.positions.get(ptr);
        let count = if self.has_counts {
            self.positions.get(ptr + 1)
        } else {
            len
        };
        (len, count)
    }

    #[inline]
    pub(crate) fn entry_count(&self, e: u64) -> u64 {
        self.entry_len_count(e).1
    }

    /// Append the positions of entry `e` to `posn`; returns the count.
    pub(crate) fn load_positions(&self, e: u64, posn: &mut Vec<u64>) -> u64 {
        if self.entry_unique(e) {
            posn.push(self.entry_value(e));
            return 1;
        }
        let (len, count) = self.entry_len_count(e);
        let first = self.entry_value(e) + self.header_slots();
        posn.reserve(len as usize);
        for i in first..first + len {
            posn.push(self.positions.get(i));
        }
        count
    }

    // -------- Mutation --------

    /// Drop every mer whose count falls outside `[lo, hi]`.
    ///
    /// Entries, lists and offsets are compacted in place; dropped mers cannot
    /// be recovered by a later, wider call.
    pub fn filter(&mut self, lo: u64, hi: u64) {
        if !self.data_loaded {
            return;
        }
        let table = self.codec.table_entries();
        let header = self.header_slots();
        let mut counts = MerCounts {
            positions: self.counts.positions,
            ..MerCounts::default()
        };
        let mut w_entry = 0u64;
        let mut w_pos = 0u64;
        let mut next_start = self.offsets.get(0);

        for b in 0..table {
            let start = next_start;
            let end = self.offsets.get(b + 1);
            next_start = end;
            self.offsets.set(b, w_entry);

            for i in start..end {
                let e = self.entries.get(i);
                let (len, count) = self.entry_len_count(e);
                if count < lo || count > hi {
                    continue;
                }
                let kept = if self.entry_unique(e) {
                    e
                } else {
                    let ptr = self.entry_value(e);
                    // lists are laid out in entry order, so the write cursor
                    // never passes the read cursor
                    for j in 0..header + len {
                        let v = self.positions.get(ptr + j);
                        self.positions.set(w_pos + j, v);
                    }
                    let moved = self.pack_entry(false, self.entry_check(e), w_pos);
                    w_pos += header + len;
                    moved
                };
                self.entries.set(w_entry, kept);
                w_entry += 1;

                counts.mers += len;
                counts.distinct += 1;
                if count == 1 {
                    counts.unique += 1;
                }
            }
        }
        self.offsets.set(table, w_entry);
        self.entries.truncate(w_entry);
        self.positions.truncate(w_pos);
        counts.entries = w_entry;

        log::debug!(
            "filter [{lo}, {hi}]: kept {} of {} distinct mers",
            counts.distinct,
            self.counts.distinct
        );
        self.counts = counts;
    }

    // -------- Diagnostics --------

    /// Dump geometry, field widths and counters.
    pub fn print_state<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let (shift1, shift2) = self.codec.shifts();
        writeln!(w, "merSizeInBases:   {}", self.mer_size)?;
        writeln!(w, "merSizeInBits:    {}", self.codec.mer_bits())?;
        writeln!(w, "merSkipInBases:   {}", self.mer_skip)?;
        writeln!(w, "tableSizeInBits:  {}", self.codec.table_bits())?;
        writeln!(w, "tableSizeEntries: {}", self.codec.table_entries())?;
        writeln!(w, "shift1:           {shift1}")?;
        writeln!(w, "shift2:           {shift2}")?;
        writeln!(w, "hashWidth:        {}", self.widths.hash)?;
        writeln!(w, "chckWidth:        {}", self.widths.chck)?;
        writeln!(w, "posnWidth:        {}", self.widths.posn)?;
        writeln!(w, "pptrWidth:        {}", self.widths.pptr)?;
        writeln!(w, "listWidth:        {}", self.widths.list)?;
        writeln!(w, "entryWidth:       {}", self.widths.entry())?;
        writeln!(w, "externalCounts:   {}", self.has_counts)?;
        writeln!(w, "maxMismatch:      {}", self.matcher.errors_allowed())?;
        writeln!(w, "approxMers:       {}", self.approx_mers)?;
        writeln!(w, "numberOfMers:     {}", self.counts.mers)?;
        writeln!(w, "numberOfPositions:{}", self.counts.positions)?;
        writeln!(w, "numberOfDistinct: {}", self.counts.distinct)?;
        writeln!(w, "numberOfUnique:   {}", self.counts.unique)?;
        writeln!(w, "numberOfEntries:  {}", self.counts.entries)?;
        writeln!(w, "dataLoaded:       {}", self.data_loaded)?;
        writeln!(w, "mappedImage:      {}", self.entries.is_mapped())?;
        writeln!(w, "memoryBytes:      {}", self.memory_bytes())?;
        Ok(())
    }
}
