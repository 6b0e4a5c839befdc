//! Invertible split of a mer into a table address and a check value.
//!
//! ```text
//!  hash  = ((k >> shift1) ^ (k >> shift2) ^ k) & mask1      table_bits wide
//!  check = k & mask2                                         shift1 wide
//! ```
//!
//! `shift1 = mer_bits - table_bits`, `shift2 = shift1 / 2`. The address folds
//! the high bits of the mer onto the low ones so biased base composition does
//! not cluster buckets; the check holds the low `shift1` bits verbatim, and the
//! two fields together determine the mer exactly (see [`KeyCodec::rebuild`]).

use crate::bits::low_mask;
use crate::index::IndexError;

/// Largest supported mer, in bases (2 bits per base in a `u64`).
pub const MAX_MER_SIZE: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyCodec {
    mer_bits: u32,
    table_bits: u32,
    shift1: u32,
    shift2: u32,
    mask1: u64,
    mask2: u64,
}

impl KeyCodec {
    /// Derive the codec for `mer_size` bases and a `2^table_bits` table.
    pub fn new(mer_size: u32, table_bits: u32) -> Result<Self, IndexError> {
        if mer_size == 0 || mer_size > MAX_MER_SIZE {
            return Err(IndexError::Parameter(format!(
                "mer size {mer_size} outside 1..={MAX_MER_SIZE}"
            )));
        }
        let mer_bits = 2 * mer_size;
        if table_bits == 0 || table_bits + 2 > mer_bits {
            return Err(IndexError::Parameter(format!(
                "table size of {table_bits} bits needs 1..={} for {mer_size}-mers",
                mer_bits.saturating_sub(2)
            )));
        }
        let shift1 = mer_bits - table_bits;
        let shift2 = shift1 / 2;
        let codec = KeyCodec {
            mer_bits,
            table_bits,
            shift1,
            shift2,
            mask1: low_mask(table_bits),
            mask2: low_mask(shift1),
        };

        let top = low_mask(mer_bits);
        for k in [0, top, top & 0x5555_5555_5555_5555, top & 0xAAAA_AAAA_AAAA_AAAA, 1, top >> 1] {
            if !codec.verify(k) {
                return Err(IndexError::Parameter(format!(
                    "codec does not round-trip {k:#x} (shift1={shift1} shift2={shift2})"
                )));
            }
        }
        Ok(codec)
    }

    #[inline]
    pub fn mer_bits(&self) -> u32 {
        self.mer_bits
    }

    #[inline]
    pub fn mer_mask(&self) -> u64 {
        low_mask(self.mer_bits)
    }

    #[inline]
    pub fn table_bits(&self) -> u32 {
        self.table_bits
    }

    /// Number of buckets, `2^table_bits`.
    #[inline]
    pub fn table_entries(&self) -> u64 {
        1u64 << self.table_bits
    }

    #[inline]
    pub fn shifts(&self) -> (u32, u32) {
        (self.shift1, self.shift2)
    }

    /// Width of the check field in bits.
    #[inline]
    pub fn check_width(&self) -> u32 {
        self.shift1
    }

    #[inline]
    pub fn hash(&self, k: u64) -> u64 {
        ((k >> self.shift1) ^ (k >> self.shift2) ^ k) & self.mask1
    }

    #[inline]
    pub fn check(&self, k: u64) -> u64 {
        k & self.mask2
    }

    /// Recover the mer from its address and check value.
    ///
    /// Address bit `i` is `k[shift1+i] ^ k[shift2+i] ^ k[i]`, so the bits
    /// above `shift1` come back in blocks of `shift1 - shift2`, lowest first,
    /// each block needing only bits recovered before it.
    #[inline]
    pub fn rebuild(&self, h: u64, c: u64) -> u64 {
        let block = self.shift1 - self.shift2;
        let msk = low_mask(block);
        let mut mer = c & self.mask2;
        let mut g = 0u32;
        while self.shift1 + g < self.mer_bits {
            let bits = ((h >> g) ^ (mer >> g) ^ (mer >> (self.shift2 + g))) & msk;
            mer |= bits << (self.shift1 + g);
            g += block;
        }
        mer & low_mask(self.mer_bits)
    }

    /// True when `k` survives `hash`/`check`/`rebuild` unchanged.
    #[inline]
    pub fn verify(&self, k: u64) -> bool {
        let k = k & self.mer_mask();
        self.rebuild(self.hash(k), self.check(k)) == k
    }
}
