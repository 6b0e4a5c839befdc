//! Mer encoding: 2-bit mapping, reverse complement, canonicalization and
//! base-level mismatch counting.
//!
//! Conventions
//! - Codes are **LSB-aligned**: a `k`-mer uses the lower `2k` bits, first base
//!   in the highest pair.
//! - A = 0, C = 1, G = 2, T/U = 3.

/// 256-entry LUT: ASCII → 2-bit (A=0, C=1, G=2, T/U=3), 0xFF for ambiguous.
pub static MAP_LUT: [u8; 256] = {
    const X: u8 = 0xFF;
    let mut t = [X; 256];
    t[b'A' as usize] = 0;
    t[b'a' as usize] = 0;
    t[b'C' as usize] = 1;
    t[b'c' as usize] = 1;
    t[b'G' as usize] = 2;
    t[b'g' as usize] = 2;
    t[b'T' as usize] = 3;
    t[b't' as usize] = 3;
    t[b'U' as usize] = 3;
    t[b'u' as usize] = 3;
    t
};

const BASES: [u8; 4] = *b"ACGT";

/// 2-bit encoding via LUT. `None` if ambiguous.
#[inline]
pub fn map_base(b: u8) -> Option<u8> {
    let v = MAP_LUT[b as usize];
    if v <= 3 { Some(v) } else { None }
}

/// Encode a k-mer window to an LSB-aligned `u64`. `None` if `k > 32` or ambiguous.
#[inline]
pub fn encode_kmer(window: &[u8]) -> Option<u64> {
    let k = window.len();
    if k == 0 || k > 32 {
        return None;
    }
    let mut code: u64 = 0;
    for &b in window {
        let v = map_base(b)? as u64;
        code = (code << 2) | v;
    }
    Some(code)
}

/// Decode the lower `2k` bits of `code` back to ASCII bases.
pub fn decode_kmer(code: u64, k: usize) -> Vec<u8> {
    debug_assert!(k <= 32);
    (0..k)
        .rev()
        .map(|i| BASES[((code >> (2 * i)) & 0b11) as usize])
        .collect()
}

/// Reverse-complement an LSB-aligned code (lower `2k` bits used).
#[inline]
pub fn revcomp(code_lsb: u64, k: usize) -> u64 {
    debug_assert!(k <= 32);
    let mut rc: u64 = 0;
    for i in 0..k {
        let base = (code_lsb >> (i * 2)) & 0b11;
        let comp = base ^ 0b11;
        let shift = (k - 1 - i) * 2;
        rc |= comp << shift;
    }
    rc
}

/// Smaller of a code and its reverse complement.
#[inline]
pub fn canonical(code_lsb: u64, k: usize) -> u64 {
    code_lsb.min(revcomp(code_lsb, k))
}

/// Number of 2-bit bases in which `a` and `b` differ.
#[inline]
pub fn base_mismatches(a: u64, b: u64) -> u32 {
    let x = a ^ b;
    ((x | (x >> 1)) & 0x5555_5555_5555_5555).count_ones()
}
