//! Fixed-width bit-packed integer arrays.
//!
//! Values of `width` bits are laid out back to back in little-endian `u64`
//! words; a value may straddle two words. All field access goes through
//! explicit shift/mask arithmetic.

use std::sync::Arc;

use memmap2::Mmap;

/// Mask with the low `bits` bits set (`bits` may be 64).
#[inline]
pub fn low_mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

/// Number of bits needed to store `n` (at least 1).
#[inline]
pub fn bit_width(n: u64) -> u32 {
    (64 - n.leading_zeros()).max(1)
}

/// Backing words: owned, or a read-only view into a mapped image.
#[derive(Clone, Debug)]
enum Words {
    Owned(Vec<u64>),
    Mapped {
        map: Arc<Mmap>,
        start: usize,
        len: usize,
    },
}

impl Default for Words {
    fn default() -> Self {
        Words::Owned(Vec::new())
    }
}

#[derive(Clone, Debug, Default)]
pub struct BitPackedArray {
    width: u32,
    len: u64,
    words: Words,
}

impl PartialEq for BitPackedArray {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width && self.len == other.len && self.words() == other.words()
    }
}

impl Eq for BitPackedArray {}

impl BitPackedArray {
    /// Zero-filled array of `len` values, `width` bits each (1..=64).
    pub fn new(width: u32, len: u64) -> Self {
        debug_assert!((1..=64).contains(&width));
        let words = Self::words_for(width, len);
        Self {
            width,
            len,
            words: Words::Owned(vec![0u64; words]),
        }
    }

    /// Rebuild from raw words (persistence). `None` if the word count does
    /// not match `width * len`.
    pub fn from_words(width: u32, len: u64, words: Vec<u64>) -> Option<Self> {
        if !(1..=64).contains(&width) || words.len() != Self::words_for(width, len) {
            return None;
        }
        Some(Self {
            width,
            len,
            words: Words::Owned(words),
        })
    }

    /// View `words_for(width, len)` native-endian words of `map` starting at
    /// byte `start`. `None` if the range is out of bounds or not 8-byte
    /// aligned. The first write copies the words out.
    pub fn from_mapped(width: u32, len: u64, map: Arc<Mmap>, start: usize) -> Option<Self> {
        if !(1..=64).contains(&width) {
            return None;
        }
        let n = Self::words_for(width, len);
        let end = start.checked_add(n.checked_mul(8)?)?;
        let bytes = map.get(start..end)?;
        bytemuck::try_cast_slice::<u8, u64>(bytes).ok()?;
        Some(Self {
            width,
            len,
            words: Words::Mapped { map, start, len: n },
        })
    }

    #[inline]
    pub fn words_for(width: u32, len: u64) -> usize {
        (width as u64).saturating_mul(len).div_ceil(64) as usize
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn words(&self) -> &[u64] {
        match &self.words {
            Words::Owned(v) => v,
            // alignment and bounds checked in from_mapped
            Words::Mapped { map, start, len } => bytemuck::cast_slice(&map[*start..*start + 8 * *len]),
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.words, Words::Mapped { .. })
    }

    fn owned(&mut self) -> &mut Vec<u64> {
        if let Words::Mapped { .. } = self.words {
            self.words = Words::Owned(self.words().to_vec());
        }
        match &mut self.words {
            Words::Owned(v) => v,
            Words::Mapped { .. } => unreachable!("mapped words were copied above"),
        }
    }

    /// Size of the backing store in bytes.
    pub fn bytes(&self) -> usize {
        self.words().len() * std::mem::size_of::<u64>()
    }

    #[inline]
    pub fn get(&self, i: u64) -> u64 {
        debug_assert!(i < self.len);
        let bit = i * self.width as u64;
        let w = (bit >> 6) as usize;
        let off = (bit & 63) as u32;
        let mask = low_mask(self.width);
        let words = self.words();
        let lo = words[w] >> off;
        if off + self.width <= 64 {
            lo & mask
        } else {
            (lo | (words[w + 1] << (64 - off))) & mask
        }
    }

    #[inline]
    pub fn set(&mut self, i: u64, value: u64) {
        debug_assert!(i < self.len);
        let bit = i * self.width as u64;
        let w = (bit >> 6) as usize;
        let off = (bit & 63) as u32;
        let mask = low_mask(self.width);
        let value = value & mask;
        let width = self.width;
        let words = self.owned();
        words[w] = (words[w] & !(mask << off)) | (value << off);
        if off + width > 64 {
            let spill = 64 - off;
            let hi_mask = mask >> spill;
            words[w + 1] = (words[w + 1] & !hi_mask) | (value >> spill);
        }
    }

    /// Shrink the logical length; the tail words are released.
    pub fn truncate(&mut self, len: u64) {
        if len >= self.len {
            return;
        }
        self.len = len;
        let keep = Self::words_for(self.width, len);
        let used = (self.width as u64 * len) & 63;
        let words = self.owned();
        words.truncate(keep);
        words.shrink_to_fit();
        // clear stale bits past the end so saved images stay deterministic
        if used != 0 {
            if let Some(last) = words.last_mut() {
                *last &= low_mask(used as u32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_and_masks() {
        assert_eq!(bit_width(0), 1);
        assert_eq!(bit_width(1), 1);
        assert_eq!(bit_width(2), 2);
        assert_eq!(bit_width(255), 8);
        assert_eq!(bit_width(256), 9);
        assert_eq!(bit_width(u64::MAX), 64);
        assert_eq!(low_mask(0), 0);
        assert_eq!(low_mask(3), 0b111);
        assert_eq!(low_mask(64), u64::MAX);
    }

    #[test]
    fn straddling_values_survive() {
        for width in [1u32, 3, 7, 13, 31, 33, 50, 63, 64] {
            let n = 200u64;
            let mut a = BitPackedArray::new(width, n);
            let mask = low_mask(width);
            for i in 0..n {
                a.set(i, i.wrapping_mul(0x9E37_79B9_7F4A_7C15) & mask);
            }
            for i in 0..n {
                assert_eq!(a.get(i), i.wrapping_mul(0x9E37_79B9_7F4A_7C15) & mask, "w={width} i={i}");
            }
        }
    }

    #[test]
    fn set_does_not_clobber_neighbours() {
        let mut a = BitPackedArray::new(11, 20);
        for i in 0..20 {
            a.set(i, low_mask(11));
        }
        a.set(5, 0);
        assert_eq!(a.get(4), low_mask(11));
        assert_eq!(a.get(5), 0);
        assert_eq!(a.get(6), low_mask(11));
    }

    #[test]
    fn truncate_keeps_prefix() {
        let mut a = BitPackedArray::new(9, 100);
        for i in 0..100 {
            a.set(i, i * 3);
        }
        a.truncate(10);
        assert_eq!(a.len(), 10);
        assert_eq!(a.words().len(), BitPackedArray::words_for(9, 10));
        for i in 0..10 {
            assert_eq!(a.get(i), i * 3);
        }
        assert!(BitPackedArray::from_words(9, 10, a.words().to_vec()).is_some());
        assert!(BitPackedArray::from_words(9, 20, a.words().to_vec()).is_none());
    }

    #[test]
    fn mapped_view_reads_and_copies_on_write() -> std::io::Result<()> {
        use std::io::Write;

        let mut src = BitPackedArray::new(13, 50);
        for i in 0..50 {
            src.set(i, i * 101);
        }
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&[0u8; 8])?;
        file.write_all(bytemuck::cast_slice::<u64, u8>(src.words()))?;
        file.flush()?;
        let map = Arc::new(unsafe { Mmap::map(file.as_file())? });

        assert!(BitPackedArray::from_mapped(13, 50, map.clone(), 4).is_none());
        assert!(BitPackedArray::from_mapped(13, 51, map.clone(), 8).is_none());
        let mut view = BitPackedArray::from_mapped(13, 50, map, 8).unwrap();
        assert!(view.is_mapped());
        if cfg!(target_endian = "little") {
            assert_eq!(view, src);
        }
        view.set(3, 7);
        assert!(!view.is_mapped());
        assert_eq!(view.get(3), 7);
        assert_eq!(view.words().len(), src.words().len());
        Ok(())
    }
}
