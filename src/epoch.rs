use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

use crate::heap::Heap;

//-------------------------------------------------------------------------

// A retired node sits out this many epoch advances before its memory can
// be handed back.
const GRACE: u64 = 2;

// Queue length at which retire attempts an advance-and-reclaim pass.
const RECLAIM_PRESSURE: usize = 64;

struct Retired {
    ptr: usize,
    epoch: u64,
    free: unsafe fn(*mut u8, &dyn Heap),
    heap: Arc<dyn Heap>,
}

//-------------------------------------------------------------------------

/// Per-thread epoch slot.  Slots are leaked once allocated and recycled
/// between threads through the in_use flag.
struct ThreadSlot {
    epoch: AtomicU64,
    active: AtomicU32,
    in_use: AtomicBool,
    next: AtomicPtr<ThreadSlot>,
}

impl ThreadSlot {
    fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            active: AtomicU32::new(0),
            in_use: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

//-------------------------------------------------------------------------

/// Epoch-based reclamation: a global epoch, registered reader slots, and a
/// queue of retired nodes waiting out their grace period.
pub struct EpochDomain {
    epoch: AtomicU64,
    slots: AtomicPtr<ThreadSlot>,
    retired: Mutex<Vec<Retired>>,
}

static GLOBAL: EpochDomain = EpochDomain::new();

thread_local! {
    static HANDLE: SlotHandle = SlotHandle {
        slot: EpochDomain::global().acquire_slot(),
    };
}

struct SlotHandle {
    slot: &'static ThreadSlot,
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.slot.in_use.store(false, Ordering::Release);
    }
}

impl EpochDomain {
    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            slots: AtomicPtr::new(ptr::null_mut()),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn global() -> &'static EpochDomain {
        &GLOBAL
    }

    fn acquire_slot(&'static self) -> &'static ThreadSlot {
        // Reuse a slot abandoned by a dead thread if there is one.
        let mut cur = self.slots.load(Ordering::Acquire);
        while !cur.is_null() {
            let slot = unsafe { &*cur };
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return slot;
            }
            cur = slot.next.load(Ordering::Acquire);
        }

        let slot: &'static ThreadSlot = Box::leak(Box::new(ThreadSlot::new()));
        loop {
            let head = self.slots.load(Ordering::Relaxed);
            slot.next.store(head, Ordering::Relaxed);
            if self
                .slots
                .compare_exchange_weak(head, slot as *const _ as *mut _, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return slot;
            }
        }
    }

    /// Enter a read-side critical section.  The slot is stamped with the
    /// current global epoch; nested guards just bump the depth.
    pub fn pin(&'static self) -> Guard {
        let slot = HANDLE.with(|h| h.slot);
        if slot.active.load(Ordering::Relaxed) == 0 {
            slot.epoch
                .store(self.epoch.load(Ordering::SeqCst), Ordering::SeqCst);
        }
        slot.active.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        Guard {
            slot,
            _not_send: PhantomData,
        }
    }

    /// Queue a node for deferred freeing.
    ///
    /// # Safety
    ///
    /// ptr must stay valid until free runs, and free must be the right
    /// deleter for it.
    pub unsafe fn retire(
        &self,
        ptr: *mut u8,
        free: unsafe fn(*mut u8, &dyn Heap),
        heap: Arc<dyn Heap>,
    ) {
        let mut q = self.retired.lock().unwrap();
        q.push(Retired {
            ptr: ptr as usize,
            epoch: self.epoch.load(Ordering::SeqCst),
            free,
            heap,
        });
        if q.len() >= RECLAIM_PRESSURE {
            self.try_advance();
            self.reclaim_queued(&mut q);
        }
    }

    /// Best effort: advance the epoch and free whatever has aged out.
    pub fn flush(&self) {
        self.try_advance();
        let mut q = self.retired.lock().unwrap();
        self.reclaim_queued(&mut q);
    }

    fn try_advance(&self) -> bool {
        let global = self.epoch.load(Ordering::SeqCst);

        let mut cur = self.slots.load(Ordering::Acquire);
        while !cur.is_null() {
            let slot = unsafe { &*cur };
            if slot.active.load(Ordering::SeqCst) != 0
                && slot.epoch.load(Ordering::SeqCst) != global
            {
                return false;
            }
            cur = slot.next.load(Ordering::Acquire);
        }

        self.epoch
            .compare_exchange(global, global + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    // The oldest epoch any in-flight reader is stamped with.
    fn min_active_epoch(&self) -> u64 {
        let mut min = u64::MAX;
        let mut cur = self.slots.load(Ordering::Acquire);
        while !cur.is_null() {
            let slot = unsafe { &*cur };
            if slot.active.load(Ordering::SeqCst) != 0 {
                min = min.min(slot.epoch.load(Ordering::SeqCst));
            }
            cur = slot.next.load(Ordering::Acquire);
        }
        min
    }

    fn reclaim_queued(&self, q: &mut Vec<Retired>) {
        if q.is_empty() {
            return;
        }

        let min = self.min_active_epoch();
        let before = q.len();
        let mut kept = Vec::with_capacity(q.len());
        for rec in q.drain(..) {
            if min == u64::MAX || rec.epoch + GRACE <= min {
                unsafe { (rec.free)(rec.ptr as *mut u8, rec.heap.as_ref()) };
            } else {
                kept.push(rec);
            }
        }
        let freed = before - kept.len();
        *q = kept;

        if freed > 0 {
            trace!(freed, remaining = q.len(), "epoch reclaim pass");
        }
    }
}

//-------------------------------------------------------------------------

/// Scoped read-side critical section.  Not Send: the slot belongs to the
/// pinning thread.
pub struct Guard {
    slot: &'static ThreadSlot,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        fence(Ordering::SeqCst);
        self.slot.active.fetch_sub(1, Ordering::SeqCst);
    }
}

//-------------------------------------------------------------------------

/// Construction-time choice between deferred reclamation (threaded mode)
/// and freeing replaced nodes on the spot (single-threaded mode).
pub enum Reclaim {
    Direct,
    Epoch(&'static EpochDomain),
}

impl Reclaim {
    pub fn pin(&self) -> Option<Guard> {
        match self {
            Reclaim::Direct => None,
            Reclaim::Epoch(d) => Some(d.pin()),
        }
    }

    /// # Safety
    ///
    /// Same contract as EpochDomain::retire.  In Direct mode the deleter
    /// runs immediately, so the caller must guarantee there are no
    /// concurrent readers at all.
    pub unsafe fn defer(
        &self,
        ptr: *mut u8,
        free: unsafe fn(*mut u8, &dyn Heap),
        heap: &Arc<dyn Heap>,
    ) {
        match self {
            Reclaim::Direct => free(ptr, heap.as_ref()),
            Reclaim::Epoch(d) => d.retire(ptr, free, heap.clone()),
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Reclaim::Epoch(_))
    }
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
