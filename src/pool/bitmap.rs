// Word-grouped bit array over the slots of a pool. A pool owns two of these,
// stored back to back in its header region: the initialized map and the
// reachable map. The sweep walks them a whole word at a time.

use bit_field::BitField;
use std::mem;

/// A view over `length(capacity)` machine words of externally owned memory.
/// Copyable; the pool swaps its two views at the end of each sweep.
#[derive(Clone, Copy)]
pub struct Bitmap {
    data: *mut usize,
}

unsafe impl Send for Bitmap {}

impl Bitmap {
    pub fn new(data: *mut usize) -> Bitmap {
        debug_assert!(!data.is_null());
        debug_assert!(data as usize % mem::align_of::<usize>() == 0);
        Bitmap { data }
    }

    /// Bits per group word.
    pub const fn bits() -> usize {
        mem::size_of::<usize>() * 8
    }

    /// Number of group words needed to cover `capacity` bits.
    pub const fn length(capacity: usize) -> usize {
        (capacity / Bitmap::bits()) + if capacity % Bitmap::bits() == 0 { 0 } else { 1 }
    }

    /// Bytes of memory needed to cover `capacity` bits.
    pub const fn footprint(capacity: usize) -> usize {
        Bitmap::length(capacity) * mem::size_of::<usize>()
    }

    pub fn test(&self, offset: usize) -> bool {
        unsafe { (*self.data.add(offset / Bitmap::bits())).get_bit(offset % Bitmap::bits()) }
    }

    pub fn set(&self, offset: usize) {
        unsafe {
            (*self.data.add(offset / Bitmap::bits())).set_bit(offset % Bitmap::bits(), true);
        }
    }

    pub fn reset(&self, offset: usize) {
        unsafe {
            (*self.data.add(offset / Bitmap::bits())).set_bit(offset % Bitmap::bits(), false);
        }
    }

    /// Read one whole group word.
    pub fn group(&self, word: usize) -> usize {
        unsafe { *self.data.add(word) }
    }

    /// Overwrite one whole group word.
    pub fn set_group(&self, word: usize, value: usize) {
        unsafe {
            *self.data.add(word) = value;
        }
    }

    /// Zero `words` group words starting at the view's base.
    pub fn clear(&self, words: usize) {
        unsafe {
            std::ptr::write_bytes(self.data, 0, words);
        }
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    fn test_length_and_footprint() {
        let bits = Bitmap::bits();
        assert_eq!(Bitmap::length(0), 0);
        assert_eq!(Bitmap::length(1), 1);
        assert_eq!(Bitmap::length(bits), 1);
        assert_eq!(Bitmap::length(bits + 1), 2);
        assert_eq!(Bitmap::footprint(bits * 3), 3 * mem::size_of::<usize>());
    }

    #[test]
    fn test_set_test_reset() {
        let mut backing = [0usize; 4];
        let map = Bitmap::new(backing.as_mut_ptr());
        let probes = [0, 1, Bitmap::bits() - 1, Bitmap::bits(), Bitmap::bits() * 3 + 7];
        for &i in probes.iter() {
            assert!(!map.test(i));
            map.set(i);
            assert!(map.test(i));
        }
        map.reset(Bitmap::bits());
        assert!(!map.test(Bitmap::bits()));
        assert!(map.test(Bitmap::bits() - 1));
        assert!(map.test(Bitmap::bits() * 3 + 7));
    }

    #[test]
    fn test_group_access() {
        let mut backing = [0usize; 2];
        let map = Bitmap::new(backing.as_mut_ptr());
        map.set(3);
        assert_eq!(map.group(0), 1 << 3);
        map.set_group(1, usize::MAX);
        assert!(map.test(Bitmap::bits() + 17));
        map.clear(2);
        assert_eq!(map.group(0), 0);
        assert_eq!(map.group(1), 0);
    }
}
