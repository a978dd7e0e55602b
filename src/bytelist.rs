use std::sync::atomic::{AtomicU64, Ordering};

//-------------------------------------------------------------------------

const ONES: u64 = 0x0101_0101_0101_0101;
const HIGH: u64 = 0x8080_8080_8080_8080;
const LOW56: u64 = 0x00ff_ffff_ffff_ffff;

// Mask covering the low n byte lanes (n <= 7).
fn lane_mask(n: usize) -> u64 {
    (1u64 << (8 * n)) - 1
}

// High bit set in each lane where byte(x) < byte(y), unsigned.  Splits the
// comparison into the high bit and the low seven bits; the (x | HIGH) -
// (y & !HIGH) subtraction cannot borrow across lanes.
fn lanes_lt(x: u64, y: u64) -> u64 {
    let t = (x | HIGH).wrapping_sub(y & !HIGH);
    ((!x & y) | (!(x ^ y) & !t)) & HIGH
}

//-------------------------------------------------------------------------

/// Up to seven sorted bytes plus a count, packed into one word.  Byte i of
/// the word is entry i; the top byte is the count.  Unused lanes are kept
/// zero so that insert can open a slot with a plain shift.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PackedBytes(u64);

impl PackedBytes {
    pub const CAPACITY: usize = 7;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= Self::CAPACITY);
        debug_assert!(bytes.windows(2).all(|w| w[0] < w[1]));
        let mut w = (bytes.len() as u64) << 56;
        for (i, &b) in bytes.iter().enumerate() {
            w |= (b as u64) << (8 * i);
        }
        Self(w)
    }

    pub fn len(&self) -> usize {
        (self.0 >> 56) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == Self::CAPACITY
    }

    pub fn get(&self, idx: usize) -> u8 {
        debug_assert!(idx < self.len());
        (self.0 >> (8 * idx)) as u8
    }

    /// 1-based position of c, or 0 if absent.  Branchless: broadcast c,
    /// xor, then the standard zero-lane detector; invalid lanes (and the
    /// count byte) are forced non-zero first.
    pub fn find(&self, c: u8) -> usize {
        let x = (self.0 ^ (ONES * c as u64)) | !lane_mask(self.len());
        let z = x.wrapping_sub(ONES) & !x & HIGH;
        if z == 0 {
            0
        } else {
            (z.trailing_zeros() / 8) as usize + 1
        }
    }

    pub fn contains(&self, c: u8) -> bool {
        self.find(c) != 0
    }

    /// Sorted insertion index for c: the number of present bytes below it.
    pub fn position(&self, c: u8) -> usize {
        let lt = lanes_lt(self.0, ONES * c as u64) & lane_mask(self.len());
        lt.count_ones() as usize
    }

    /// Insert c, keeping the lanes sorted.  Returns the new packing and
    /// the index the byte landed at.  The caller has already checked both
    /// capacity and absence.
    pub fn insert(&self, c: u8) -> (Self, usize) {
        debug_assert!(!self.is_full());
        debug_assert!(!self.contains(c));

        let idx = self.position(c);
        let keep = lane_mask(idx);
        let bytes = self.0 & LOW56;
        let opened = (bytes & keep) | ((bytes & !keep) << 8);
        let n = self.len() as u64;
        (
            Self(opened | ((c as u64) << (8 * idx)) | ((n + 1) << 56)),
            idx,
        )
    }

    /// Remove the entry at idx, closing the gap and re-zeroing the vacated
    /// lane.
    pub fn remove_at(&self, idx: usize) -> Self {
        debug_assert!(idx < self.len());
        let keep = lane_mask(idx);
        let bytes = self.0 & LOW56;
        let closed = (bytes & keep) | (((bytes & !lane_mask(idx + 1)) >> 8) & !keep);
        let n = self.len() as u64;
        Self((closed & LOW56) | ((n - 1) << 56))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }
}

//-------------------------------------------------------------------------

/// The packed list as it lives inside a node: one atomic word, snapshot
/// loads for readers, whole-word stores from the writer.
pub struct ByteList(AtomicU64);

impl ByteList {
    pub fn new(p: PackedBytes) -> Self {
        Self(AtomicU64::new(p.0))
    }

    pub fn snapshot(&self) -> PackedBytes {
        PackedBytes(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, p: PackedBytes) {
        self.0.store(p.0, Ordering::Release);
    }
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
