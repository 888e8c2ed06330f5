use alloc::{boxed::Box, vec};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitArray<T>(pub T);

macro_rules! impl_bitarray {
    ($($t: ty),*) => {
        $(
            impl BitArray<$t> {
                pub const BITS: usize = <$t>::BITS as usize;

                pub const fn get(&self, idx: usize) -> bool {
                    (self.0 >> idx & 1) != 0
                }

                pub const fn with(self, value: bool, idx: usize) -> Self {
                    if value {
                        BitArray(self.0 | (1 as $t) << idx)
                    } else {
                        BitArray(self.0 & !((1 as $t) << idx))
                    }
                }

                pub const fn is_full(&self) -> bool {
                    self.0 == <$t>::MAX
                }

                /// Index of the lowest clear bit, if any.
                pub const fn first_clear(&self) -> Option<usize> {
                    if self.is_full() {
                        None
                    } else {
                        Some((!self.0).trailing_zeros() as usize)
                    }
                }

                pub const fn count_ones(&self) -> usize {
                    self.0.count_ones() as usize
                }

                pub const fn load(self) -> $t { self.0 }
            }
        )*
    };
}

impl_bitarray!(u8, u16, u32, u64);

type Word = BitArray<u64>;

/// A fixed-length bitmap backed by 64-bit words.
///
/// Bits past `len` in the last word are never handed out by
/// [`Bitmap::scan_and_flip`].
#[derive(Clone, Debug)]
pub struct Bitmap {
    words: Box<[Word]>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![Word::default(); len.div_ceil(Word::BITS)].into_boxed_slice(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range ({})", self.len);
        self.words[idx / Word::BITS].get(idx % Word::BITS)
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range ({})", self.len);
        let word = &mut self.words[idx / Word::BITS];
        *word = word.with(value, idx % Word::BITS);
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(Word::count_ones).sum()
    }

    /// Finds the lowest clear bit, sets it and returns its index.
    pub fn scan_and_flip(&mut self) -> Option<usize> {
        let (word_idx, bit) = self
            .words
            .iter()
            .enumerate()
            .find_map(|(i, word)| word.first_clear().map(|bit| (i, bit)))?;
        let idx = word_idx * Word::BITS + bit;
        if idx >= self.len {
            return None;
        }
        self.set(idx, true);
        Some(idx)
    }
}
