//! Collaborators consumed by the builder: a replayable mer source, membership
//! sets for masking, and an external count authority.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::BuildHasher;

use crate::encode::MAP_LUT;
use crate::index::IndexError;

/// One mer occurrence: the LSB-aligned code and its position in the corpus.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug, Hash)]
pub struct MerPosition {
    pub mer: u64,
    pub position: u64,
}

impl MerPosition {
    #[inline]
    pub fn new(mer: u64, position: u64) -> Self {
        Self { mer, position }
    }
}

impl From<(u64, u64)> for MerPosition {
    fn from((mer, position): (u64, u64)) -> Self {
        Self { mer, position }
    }
}

/// A finite source that can be replayed from the start any number of times.
///
/// The build consumes [`keys`](KeySource::keys) twice (count, then fill); both
/// passes must yield the same sequence.
pub trait KeySource {
    type Keys<'a>: Iterator<Item = MerPosition>
    where
        Self: 'a;

    /// A fresh iterator positioned at the first mer.
    fn keys(&self) -> Self::Keys<'_>;

    /// Estimate of the number of mers, used only for sizing.
    fn approximate_len(&self) -> u64;
}

impl KeySource for [MerPosition] {
    type Keys<'a> = std::iter::Copied<std::slice::Iter<'a, MerPosition>>;

    fn keys(&self) -> Self::Keys<'_> {
        self.iter().copied()
    }

    fn approximate_len(&self) -> u64 {
        self.len() as u64
    }
}

impl KeySource for Vec<MerPosition> {
    type Keys<'a> = std::iter::Copied<std::slice::Iter<'a, MerPosition>>;

    fn keys(&self) -> Self::Keys<'_> {
        self.iter().copied()
    }

    fn approximate_len(&self) -> u64 {
        self.len() as u64
    }
}

/// Membership test used for the `mask` (drop) and `only` (keep) filters.
pub trait KeySet: Sync {
    fn contains_key(&self, mer: u64) -> bool;
}

impl<S: BuildHasher + Sync> KeySet for HashSet<u64, S> {
    fn contains_key(&self, mer: u64) -> bool {
        self.contains(&mer)
    }
}

impl KeySet for BTreeSet<u64> {
    fn contains_key(&self, mer: u64) -> bool {
        self.contains(&mer)
    }
}

/// External per-mer counts; when present they replace occurrence counting.
pub trait CountAuthority: Sync {
    fn count(&self, mer: u64) -> Option<u64>;
}

impl<S: BuildHasher + Sync> CountAuthority for HashMap<u64, u64, S> {
    fn count(&self, mer: u64) -> Option<u64> {
        self.get(&mer).copied()
    }
}

impl CountAuthority for BTreeMap<u64, u64> {
    fn count(&self, mer: u64) -> Option<u64> {
        self.get(&mer).copied()
    }
}

// ---- Sequence-backed source ----

/// Replayable mers over in-memory sequences.
///
/// Positions count bases across the concatenation of all sequences, so every
/// occurrence has a distinct position. Ambiguous bases reset the window.
pub struct SeqMerStream {
    seqs: Vec<Vec<u8>>,
    k: usize,
    canonical: bool,
}

impl SeqMerStream {
    /// `k` must be in `1..=32`.
    pub fn new(seqs: Vec<Vec<u8>>, k: usize, canonical: bool) -> Result<Self, IndexError> {
        if !(1..=32).contains(&k) {
            return Err(IndexError::Parameter(format!("k-mer size {k} outside 1..=32")));
        }
        Ok(Self { seqs, k, canonical })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Total number of bases across all sequences.
    pub fn total_len(&self) -> u64 {
        self.seqs.iter().map(|s| s.len() as u64).sum()
    }
}

impl KeySource for SeqMerStream {
    type Keys<'a> = SeqMers<'a>;

    fn keys(&self) -> SeqMers<'_> {
        let mask = if self.k == 32 {
            u64::MAX
        } else {
            (1u64 << (2 * self.k)) - 1
        };
        SeqMers {
            seqs: &self.seqs,
            k: self.k,
            canonical: self.canonical,
            mask,
            seq: 0,
            i: 0,
            base: 0,
            fwd: 0,
            rc: 0,
            len: 0,
        }
    }

    fn approximate_len(&self) -> u64 {
        self.seqs
            .iter()
            .map(|s| (s.len() as u64).saturating_sub(self.k as u64 - 1))
            .sum()
    }
}

/// Rolling forward/reverse-complement scan behind [`SeqMerStream`].
pub struct SeqMers<'a> {
    seqs: &'a [Vec<u8>],
    k: usize,
    canonical: bool,
    mask: u64,
    seq: usize,
    i: usize,
    base: u64,
    fwd: u64,
    rc: u64,
    len: usize,
}

impl Iterator for SeqMers<'_> {
    type Item = MerPosition;

    fn next(&mut self) -> Option<MerPosition> {
        loop {
            let seq = self.seqs.get(self.seq)?;
            if self.i >= seq.len() {
                self.base += seq.len() as u64;
                self.seq += 1;
                self.i = 0;
                self.fwd = 0;
                self.rc = 0;
                self.len = 0;
                continue;
            }
            let v_raw = MAP_LUT[seq[self.i] as usize];
            self.i += 1;
            if v_raw > 3 {
                self.fwd = 0;
                self.rc = 0;
                self.len = 0;
                continue;
            }
            let v = v_raw as u64;
            self.fwd = ((self.fwd << 2) | v) & self.mask;
            self.rc = (self.rc >> 2) | ((v ^ 0b11) << (2 * (self.k - 1)));
            self.len += 1;
            if self.len >= self.k {
                let mer = if self.canonical {
                    self.fwd.min(self.rc)
                } else {
                    self.fwd
                };
                let position = self.base + (self.i - self.k) as u64;
                return Some(MerPosition { mer, position });
            }
        }
    }
}
