//! LSD radix sort for packed `(check << posn_width) | position` words.
//! 8-bit passes over the significant bits only. Stable via counting + prefix sums.

/// Below this length a comparison sort wins.
const SMALL_SORT: usize = 64;

/// Sort `keys` ascending, looking only at the low `bits` bits (all other bits
/// must be zero). `scratch` is reused across calls to avoid reallocation.
pub fn radix_sort_u64(keys: &mut [u64], bits: u32, scratch: &mut Vec<u64>) {
    let n = keys.len();
    if n <= 1 {
        return;
    }
    if n < SMALL_SORT {
        keys.sort_unstable();
        return;
    }

    scratch.clear();
    scratch.resize(n, 0);

    let passes = bits.div_ceil(8).max(1);
    // For each byte, perform a counting sort pass.
    for pass in 0..passes {
        let shift = pass * 8;
        let mut counts = [0usize; 256];

        // Count occurrences
        for &k in keys.iter() {
            counts[((k >> shift) & 0xFF) as usize] += 1;
        }

        // Every key shares this byte: nothing to move.
        if counts.iter().any(|&c| c == n) {
            continue;
        }

        // Prefix sums -> positions
        let mut sum = 0usize;
        for c in counts.iter_mut() {
            let tmp = *c;
            *c = sum;
            sum += tmp;
        }

        // Scatter to scratch (stable)
        for &k in keys.iter() {
            let b = ((k >> shift) & 0xFF) as usize;
            scratch[counts[b]] = k;
            counts[b] += 1;
        }

        keys.copy_from_slice(scratch);
    }
}
