use std::alloc::Layout;
use std::hint;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::heap::{Heap, Result};

//-------------------------------------------------------------------------

pub const CELL_WRITE: u64 = 0b01;
pub const CELL_READ: u64 = 0b10;
pub const CELL_PTR: u64 = !(CELL_WRITE | CELL_READ);

/// Heap cell for a single value.  The alignment keeps the two low bits of
/// the cell pointer free for the protocol flags.
#[repr(align(8))]
struct Slab<V>(V);

pub fn alloc_slab<V>(heap: &dyn Heap, v: V) -> Result<*mut u8> {
    let p = heap.alloc(Layout::new::<Slab<V>>())?.as_ptr() as *mut Slab<V>;
    unsafe { std::ptr::write(p, Slab(v)) };
    Ok(p as *mut u8)
}

/// # Safety
///
/// p must have come from alloc_slab::<V> and not been freed.
pub unsafe fn free_slab<V>(heap: &dyn Heap, p: *mut u8) {
    let p = p as *mut Slab<V>;
    std::ptr::drop_in_place(p);
    heap.dealloc(p as *mut u8, Layout::new::<Slab<V>>());
}

pub unsafe fn free_slab_erased<V>(p: *mut u8, heap: &dyn Heap) {
    free_slab::<V>(heap, p);
}

unsafe fn slab_ref<'a, V>(word: u64) -> &'a V {
    &(*((word & CELL_PTR) as *const Slab<V>)).0
}

//-------------------------------------------------------------------------

pub enum CellRead<V> {
    Value(V),
    Empty,
    /// A writer owns the cell; the caller restarts from the root, since
    /// the ancestor chain may have been rebuilt underneath it.
    Conflict,
}

/// One 64-bit word: a slab pointer plus the WRITE and READ protocol bits.
///
/// The cell does not own its slab for drop purposes; whoever tears a node
/// down frees the remaining slabs through the heap it allocated them from.
pub struct ValueCell<V> {
    word: AtomicU64,
    phantom: PhantomData<V>,
}

impl<V> ValueCell<V> {
    pub fn empty() -> Self {
        Self {
            word: AtomicU64::new(0),
            phantom: PhantomData,
        }
    }

    /// The pointer portion of the word, stripped of protocol bits.
    pub fn pointer_word(&self) -> u64 {
        self.word.load(Ordering::Acquire) & CELL_PTR
    }

    pub fn is_present(&self) -> bool {
        self.pointer_word() != 0
    }

    /// True if a writer has the cell mid-update.
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Acquire) & CELL_WRITE != 0
    }

    /// Initial install into a cell that is not yet visible to any reader.
    pub fn init(&self, slab: u64) {
        self.word.store(slab, Ordering::Relaxed);
    }

    /// Raw word store, used when a writer shifts packed entries around.
    /// Protocol bits are stripped: a READ bit belongs to the lane its
    /// reader acquired it on, not to the moved contents.
    pub fn set_word(&self, w: u64) {
        self.word.store(w & CELL_PTR, Ordering::Release);
    }

    /// Reader protocol.  Fails over to Conflict whenever a writer holds
    /// the cell; spins while another reader does.
    pub fn try_read(&self) -> CellRead<V>
    where
        V: Clone,
    {
        loop {
            let w = self.word.load(Ordering::Acquire);
            if w & CELL_WRITE != 0 {
                return CellRead::Conflict;
            }
            if w & CELL_PTR == 0 {
                return CellRead::Empty;
            }
            if w & CELL_READ != 0 {
                hint::spin_loop();
                continue;
            }

            if self
                .word
                .compare_exchange_weak(w, w | CELL_READ, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let v = unsafe { slab_ref::<V>(w) }.clone();

            // A concurrent entry shift may have rewritten the whole word;
            // fetch_and keeps that rewrite intact while dropping our claim.
            self.word.fetch_and(!CELL_READ, Ordering::Release);
            return CellRead::Value(v);
        }
    }

    /// Writer protocol: claim the cell, wait out any reader, then publish
    /// the new slab (clearing the claim in the same store).
    pub fn replace(&self, slab: u64) -> u64 {
        self.word.fetch_or(CELL_WRITE, Ordering::AcqRel);
        while self.word.load(Ordering::Acquire) & CELL_READ != 0 {
            hint::spin_loop();
        }
        self.word.swap(slab, Ordering::AcqRel) & CELL_PTR
    }

    /// Evacuate the slab, leaving WRITE set for good.  Readers parked on
    /// this cell see the claim and restart from the root; the node the
    /// cell belongs to is on its way to retirement.
    pub fn take(&self) -> u64 {
        self.word.fetch_or(CELL_WRITE, Ordering::AcqRel);
        while self.word.load(Ordering::Acquire) & CELL_READ != 0 {
            hint::spin_loop();
        }
        self.word.swap(CELL_WRITE, Ordering::AcqRel) & CELL_PTR
    }

    /// Direct read of the slab value.  Only sound while the caller holds
    /// the writer lock, which keeps the slab pointer stable.
    pub unsafe fn peek(&self) -> Option<&V> {
        let w = self.word.load(Ordering::Acquire) & CELL_PTR;
        if w == 0 {
            None
        } else {
            Some(slab_ref::<V>(w))
        }
    }
}

//-------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::GlobalHeap;

    #[test]
    fn test_empty_cell() {
        let cell: ValueCell<u64> = ValueCell::empty();
        assert!(!cell.is_present());
        assert!(matches!(cell.try_read(), CellRead::Empty));
    }

    #[test]
    fn test_install_read_take() {
        let heap = GlobalHeap;
        let cell: ValueCell<u64> = ValueCell::empty();

        let slab = alloc_slab(&heap, 42u64).unwrap();
        cell.init(slab as u64);
        assert!(cell.is_present());

        match cell.try_read() {
            CellRead::Value(v) => assert_eq!(v, 42),
            _ => panic!("expected a value"),
        }

        let taken = cell.take();
        assert_eq!(taken, slab as u64);
        assert!(matches!(cell.try_read(), CellRead::Conflict));
        unsafe { free_slab::<u64>(&heap, taken as *mut u8) };
    }

    #[test]
    fn test_replace_returns_old() {
        let heap = GlobalHeap;
        let cell: ValueCell<String> = ValueCell::empty();

        let s1 = alloc_slab(&heap, "one".to_string()).unwrap();
        let s2 = alloc_slab(&heap, "two".to_string()).unwrap();

        assert_eq!(cell.replace(s1 as u64), 0);
        let old = cell.replace(s2 as u64);
        assert_eq!(old, s1 as u64);

        match cell.try_read() {
            CellRead::Value(v) => assert_eq!(v, "two"),
            _ => panic!("expected a value"),
        }

        unsafe {
            free_slab::<String>(&heap, old as *mut u8);
            free_slab::<String>(&heap, cell.take() as *mut u8);
        }
    }
}

//-------------------------------------------------------------------------
