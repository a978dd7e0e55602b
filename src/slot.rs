use std::sync::atomic::{AtomicU64, Ordering};

//-------------------------------------------------------------------------

pub const SLOT_WRITE: u64 = 0b01;
pub const SLOT_READ: u64 = 0b10;
pub const SLOT_TAGS: u64 = SLOT_WRITE | SLOT_READ;

// The sentinel has to be a real, aligned address that can never name a
// node; a private static fits the bill.
#[repr(align(8))]
struct SentinelCell(#[allow(dead_code)] u64);

static SENTINEL: SentinelCell = SentinelCell(0);

/// Distinguished "under construction" pointer stored into a slot between
/// the parent version bump and the install of the replacement node.
pub fn retry_sentinel() -> u64 {
    &SENTINEL as *const SentinelCell as u64
}

//-------------------------------------------------------------------------

pub enum SlotRead {
    Null,
    /// Tag bit or sentinel observed: the caller restarts from the root.
    Retry,
    Ptr(u64),
}

/// A child (or root) pointer word.  Node alignment keeps the two low bits
/// free for protocol tags; a whole-node replacement additionally parks the
/// retry sentinel here while the swap is in flight.
pub struct Slot(AtomicU64);

impl Slot {
    pub fn null() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn new(ptr: u64) -> Self {
        Self(AtomicU64::new(ptr))
    }

    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn read(&self) -> SlotRead {
        let w = self.load();
        if w == 0 {
            SlotRead::Null
        } else if w & SLOT_TAGS != 0 || w == retry_sentinel() {
            SlotRead::Retry
        } else {
            SlotRead::Ptr(w)
        }
    }

    pub fn store(&self, ptr: u64) {
        self.0.store(ptr, Ordering::Release);
    }

    pub fn store_sentinel(&self) {
        self.0.store(retry_sentinel(), Ordering::Release);
    }
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
