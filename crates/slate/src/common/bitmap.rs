use serde::{Deserialize, Serialize};

const WORD_BITS: usize = 64;

/// Fixed-width bitset used for node sets and core sets.
///
/// All bit positions are dense indices handed out by the state store or by
/// the selector's core layout; the set algebra (or/and/and_not/superset)
/// operates per 64-bit word. Bits past `nbits` are kept zero so that
/// equality and popcount are exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    nbits: usize,
    words: Vec<u64>,
}

impl Bitmap {
    pub fn new(nbits: usize) -> Self {
        Bitmap {
            nbits,
            words: vec![0; nbits.div_ceil(WORD_BITS)],
        }
    }

    pub fn filled(nbits: usize) -> Self {
        let mut map = Self::new(nbits);
        for w in &mut map.words {
            *w = u64::MAX;
        }
        map.mask_tail();
        map
    }

    pub fn from_indices(nbits: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut map = Self::new(nbits);
        for i in indices {
            map.set(i);
        }
        map
    }

    #[inline]
    pub fn nbits(&self) -> usize {
        self.nbits
    }

    #[inline]
    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < self.nbits);
        self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
    }

    #[inline]
    pub fn clear(&mut self, bit: usize) {
        debug_assert!(bit < self.nbits);
        self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
    }

    #[inline]
    pub fn test(&self, bit: usize) -> bool {
        debug_assert!(bit < self.nbits);
        (self.words[bit / WORD_BITS] >> (bit % WORD_BITS)) & 1 == 1
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn clear_all(&mut self) {
        for w in &mut self.words {
            *w = 0;
        }
    }

    pub fn set_all(&mut self) {
        for w in &mut self.words {
            *w = u64::MAX;
        }
        self.mask_tail();
    }

    pub fn or_with(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.nbits, other.nbits);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    pub fn and_with(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.nbits, other.nbits);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= o;
        }
    }

    /// Clears every bit that is set in `other`.
    pub fn and_not(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.nbits, other.nbits);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= !o;
        }
    }

    pub fn copy_from(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.nbits, other.nbits);
        self.words.copy_from_slice(&other.words);
    }

    /// True iff every bit set in `other` is also set in `self`.
    pub fn is_superset(&self, other: &Bitmap) -> bool {
        debug_assert_eq!(self.nbits, other.nbits);
        self.words.iter().zip(&other.words).all(|(w, o)| w & o == *o)
    }

    pub fn is_disjoint(&self, other: &Bitmap) -> bool {
        debug_assert_eq!(self.nbits, other.nbits);
        self.words.iter().zip(&other.words).all(|(w, o)| w & o == 0)
    }

    pub fn first_set(&self) -> Option<usize> {
        self.next_set(0)
    }

    /// First set bit at position >= `from`.
    pub fn next_set(&self, from: usize) -> Option<usize> {
        if from >= self.nbits {
            return None;
        }
        let mut word_idx = from / WORD_BITS;
        let mut word = self.words[word_idx] & (u64::MAX << (from % WORD_BITS));
        loop {
            if word != 0 {
                let bit = word_idx * WORD_BITS + word.trailing_zeros() as usize;
                return (bit < self.nbits).then_some(bit);
            }
            word_idx += 1;
            if word_idx >= self.words.len() {
                return None;
            }
            word = self.words[word_idx];
        }
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = self.first_set();
        std::iter::from_fn(move || {
            let bit = next?;
            next = self.next_set(bit + 1);
            Some(bit)
        })
    }

    /// Grows or shrinks the bitset; new bits start cleared.
    pub fn resize(&mut self, nbits: usize) {
        self.nbits = nbits;
        self.words.resize(nbits.div_ceil(WORD_BITS), 0);
        self.mask_tail();
    }

    fn mask_tail(&mut self) {
        let tail = self.nbits % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1 << tail) - 1;
            }
        }
    }
}

impl std::fmt::Display for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (idx, bit) in self.iter_set().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{bit}")?;
        }
        write!(f, "}}")
    }
}
