use std::sync::atomic::{AtomicU64, Ordering};

//-------------------------------------------------------------------------

const NR_WORDS: usize = 4;

/// One bit per possible next-byte value.
///
/// Set and clear are single-word RMWs, so a concurrent reader always sees
/// a consistent snapshot of each word.  Cross-word consistency comes from
/// the writer lock.
pub struct Bitmap256 {
    words: [AtomicU64; NR_WORDS],
}

impl Bitmap256 {
    pub fn new() -> Self {
        Self {
            words: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    fn word_bit(c: u8) -> (usize, u64) {
        ((c >> 6) as usize, 1u64 << (c & 63))
    }

    pub fn test(&self, c: u8) -> bool {
        let (w, mask) = Self::word_bit(c);
        self.words[w].load(Ordering::Acquire) & mask != 0
    }

    pub fn set(&self, c: u8) {
        let (w, mask) = Self::word_bit(c);
        self.words[w].fetch_or(mask, Ordering::AcqRel);
    }

    pub fn clear(&self, c: u8) {
        let (w, mask) = Self::word_bit(c);
        self.words[w].fetch_and(!mask, Ordering::AcqRel);
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn first_set(&self) -> Option<u8> {
        for (i, word) in self.words.iter().enumerate() {
            let w = word.load(Ordering::Acquire);
            if w != 0 {
                return Some((i * 64 + w.trailing_zeros() as usize) as u8);
            }
        }
        None
    }

    /// The k'th set byte, counting from zero in ascending byte order.
    pub fn nth_set(&self, k: usize) -> Option<u8> {
        let mut k = k;
        for (i, word) in self.words.iter().enumerate() {
            let mut w = word.load(Ordering::Acquire);
            let n = w.count_ones() as usize;
            if k < n {
                for _ in 0..k {
                    w &= w - 1;
                }
                return Some((i * 64 + w.trailing_zeros() as usize) as u8);
            }
            k -= n;
        }
        None
    }

    /// Number of set bits strictly below c.  This is the packed-array
    /// index of c when entries are stored in rank order.
    pub fn rank(&self, c: u8) -> usize {
        let (w, _) = Self::word_bit(c);
        let mut total = 0;
        for i in 0..w {
            total += self.words[i].load(Ordering::Acquire).count_ones() as usize;
        }
        let below = (1u64 << (c & 63)) - 1;
        total + (self.words[w].load(Ordering::Acquire) & below).count_ones() as usize
    }

    pub fn for_each<F: FnMut(u8)>(&self, mut f: F) {
        for (i, word) in self.words.iter().enumerate() {
            let mut w = word.load(Ordering::Acquire);
            while w != 0 {
                let bit = w.trailing_zeros() as usize;
                f((i * 64 + bit) as u8);
                w &= w - 1;
            }
        }
    }

    /// All set bytes in ascending order.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut r = Vec::with_capacity(self.count());
        self.for_each(|c| r.push(c));
        r
    }
}

impl Default for Bitmap256 {
    fn default() -> Self {
        Self::new()
    }
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
