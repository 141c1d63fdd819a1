//! Fixed-length bitmaps for per-page section state and page file occupancy.

use alloc::vec::Vec;

use crate::{MmError, MmResult};

const WORD_BITS: usize = u32::BITS as usize;

/// A bitmap with one bit per page.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u32>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all set to `value`.
    pub fn new(len: usize, value: bool) -> MmResult<Self> {
        let mut words = Vec::new();
        let count = len.div_ceil(WORD_BITS);
        words
            .try_reserve_exact(count)
            .map_err(|_| MmError::ResourceExhausted)?;

        words.resize(count, if value { u32::MAX } else { 0 });
        let mut bitmap = Self { words, len };
        bitmap.clear_tail();
        Ok(bitmap)
    }

    fn clear_tail(&mut self) {
        let used = self.len % WORD_BITS;
        if used != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1 << used) - 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        self.words
            .get(index / WORD_BITS)
            .is_some_and(|word| word & (1 << (index % WORD_BITS)) != 0)
    }

    pub fn set(&mut self, index: usize, value: bool) {
        debug_assert!(index < self.len);
        if let Some(word) = self.words.get_mut(index / WORD_BITS) {
            let bit = 1 << (index % WORD_BITS);
            if value {
                *word |= bit;
            } else {
                *word &= !bit;
            }
        }
    }

    /// Sets or clears `count` bits starting at `start`.
    pub fn set_range(&mut self, start: usize, count: usize, value: bool) {
        for index in start..start + count {
            self.set(index, value);
        }
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Returns true if any bit is set.
    pub fn any(&self) -> bool {
        self.words.iter().any(|&word| word != 0)
    }

    /// Returns a new bitmap holding bits `[start, start + len)` of this one.
    pub fn slice(&self, start: usize, len: usize) -> MmResult<Self> {
        let mut result = Self::new(len, false)?;
        for index in 0..len {
            if self.get(start + index) {
                result.set(index, true);
            }
        }

        Ok(result)
    }

    /// Shortens the bitmap to `len` bits.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
            self.words.truncate(len.div_ceil(WORD_BITS));
            self.clear_tail();
        }
    }

    /// Finds `count` consecutive clear bits, starting the search at `hint` and wrapping.
    ///
    /// Runs never span the end of the bitmap.
    pub fn find_clear_run(&self, count: usize, hint: usize) -> Option<usize> {
        if count == 0 || count > self.len {
            return None;
        }

        let hint = if hint >= self.len { 0 } else { hint };
        self.scan_clear(hint, self.len, count)
            .or_else(|| self.scan_clear(0, (hint + count - 1).min(self.len), count))
    }

    fn scan_clear(&self, start: usize, end: usize, count: usize) -> Option<usize> {
        let mut run = 0;
        for index in start..end {
            if self.get(index) {
                run = 0;
            } else {
                run += 1;
                if run == count {
                    return Some(index + 1 - count);
                }
            }
        }

        None
    }
}

impl core::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Bitmap({} of {} set)", self.count_ones(), self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_full_bitmap_has_no_stray_tail_bits() {
        let bitmap = Bitmap::new(35, true).unwrap();
        assert_eq!(bitmap.count_ones(), 35);
        assert!(bitmap.get(34));
    }

    #[test]
    fn set_and_clear() {
        let mut bitmap = Bitmap::new(70, false).unwrap();
        bitmap.set(69, true);
        bitmap.set_range(3, 4, true);
        assert_eq!(bitmap.count_ones(), 5);
        bitmap.set(5, false);
        assert!(!bitmap.get(5));
        assert!(bitmap.any());
    }

    #[test]
    fn slice_and_truncate() {
        let mut bitmap = Bitmap::new(64, false).unwrap();
        bitmap.set(10, true);
        bitmap.set(40, true);
        let tail = bitmap.slice(32, 32).unwrap();
        assert!(tail.get(8));
        assert_eq!(tail.count_ones(), 1);
        bitmap.truncate(20);
        assert_eq!(bitmap.len(), 20);
        assert_eq!(bitmap.count_ones(), 1);
    }

    #[test]
    fn clear_runs_wrap_from_hint() {
        let mut bitmap = Bitmap::new(64, false).unwrap();
        bitmap.set_range(0, 8, true);
        bitmap.set_range(40, 24, true);
        assert_eq!(bitmap.find_clear_run(4, 0), Some(8));
        assert_eq!(bitmap.find_clear_run(4, 38), Some(8));
        assert_eq!(bitmap.find_clear_run(32, 0), Some(8));
        assert_eq!(bitmap.find_clear_run(33, 0), None);
    }
}
