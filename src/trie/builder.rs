use std::alloc::Layout;
use std::sync::atomic::AtomicU64;

use crate::bitmap::Bitmap256;
use crate::bytelist::{ByteList, PackedBytes};
use crate::cell::{free_slab, ValueCell};
use crate::heap::{Heap, Result};
use crate::slot::{retry_sentinel, Slot, SLOT_TAGS};
use crate::trie::node::*;

//-------------------------------------------------------------------------

fn alloc_node<V>(heap: &dyn Heap, node: Node<V>) -> Result<*mut Node<V>> {
    let p = heap.alloc(Layout::new::<Node<V>>())?.as_ptr() as *mut Node<V>;
    unsafe { std::ptr::write(p, node) };
    Ok(p)
}

unsafe fn dealloc_node<V>(heap: &dyn Heap, p: *mut Node<V>) {
    std::ptr::drop_in_place(p);
    heap.dealloc(p as *mut u8, Layout::new::<Node<V>>());
}

fn header(shape: Shape, leaf: bool, eos: bool, poisoned: bool) -> AtomicU64 {
    let mut h = shape as u64;
    if leaf {
        h |= FLAG_LEAF;
    }
    if eos {
        h |= FLAG_EOS;
    }
    if poisoned {
        h |= FLAG_POISON;
    }
    AtomicU64::new(h)
}

//-------------------------------------------------------------------------
// Constructors.  Cells are always built empty; values are moved or
// installed under the writer lock, just before the node becomes visible.

/// Leaf holding a single key that terminates at path + skip.
pub fn skip_leaf<V>(heap: &dyn Heap, skip: &[u8], poisoned: bool) -> Result<*mut Node<V>> {
    alloc_node(
        heap,
        Node {
            header: header(Shape::Skip, true, true, poisoned),
            skip: Box::from(skip),
            eos: ValueCell::empty(),
            body: Body::SkipLeaf,
        },
    )
}

/// Interior with exactly one child.  Only legal with an EOS (a childless
/// or EOS-less single-child interior collapses by definition).
pub fn skip_node<V>(
    heap: &dyn Heap,
    skip: &[u8],
    edge: u8,
    child: u64,
    poisoned: bool,
) -> Result<*mut Node<V>> {
    alloc_node(
        heap,
        Node {
            header: header(Shape::Skip, false, true, poisoned),
            skip: Box::from(skip),
            eos: ValueCell::empty(),
            body: Body::SkipNode {
                edge,
                child: Slot::new(child),
            },
        },
    )
}

/// Leaf with the given terminal set (>= 2 bytes, sorted); the shape is the
/// smallest that fits.
pub fn leaf_with_bytes<V>(
    heap: &dyn Heap,
    skip: &[u8],
    bytes: &[u8],
    poisoned: bool,
) -> Result<*mut Node<V>> {
    debug_assert!(bytes.len() >= 2);
    debug_assert!(bytes.windows(2).all(|w| w[0] < w[1]));

    let shape = Shape::for_fanout(bytes.len());
    let body = match shape {
        Shape::Binary => Body::BinaryLeaf {
            bytes: [bytes[0], bytes[1]],
            cells: mk_cells(),
        },
        Shape::List => Body::ListLeaf {
            bytes: ByteList::new(PackedBytes::from_slice(bytes)),
            cells: mk_cells(),
        },
        Shape::Pop => {
            let b = Box::new(PopLeafBody {
                bits: Bitmap256::new(),
                cells: mk_cells(),
            });
            for &c in bytes {
                b.bits.set(c);
            }
            Body::PopLeaf(b)
        }
        Shape::Full => {
            let b = Box::new(FullLeafBody {
                bits: Bitmap256::new(),
                cells: mk_cells(),
            });
            for &c in bytes {
                b.bits.set(c);
            }
            Body::FullLeaf(b)
        }
        Shape::Skip => unreachable!("single-entry leaves are skip leaves"),
    };

    alloc_node(
        heap,
        Node {
            header: header(shape, true, false, poisoned),
            skip: Box::from(skip),
            eos: ValueCell::empty(),
            body,
        },
    )
}

/// Interior with the given (edge byte, child word) entries, sorted by
/// byte.  A single entry yields a SKIP interior, which requires eos.
pub fn node_with_children<V>(
    heap: &dyn Heap,
    skip: &[u8],
    entries: &[(u8, u64)],
    eos: bool,
    poisoned: bool,
) -> Result<*mut Node<V>> {
    debug_assert!(!entries.is_empty());
    debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));

    if entries.len() == 1 {
        debug_assert!(eos);
        return skip_node(heap, skip, entries[0].0, entries[0].1, poisoned);
    }

    let shape = Shape::for_fanout(entries.len());
    let body = match shape {
        Shape::Binary => Body::BinaryNode {
            bytes: [entries[0].0, entries[1].0],
            children: [Slot::new(entries[0].1), Slot::new(entries[1].1)],
        },
        Shape::List => {
            let bytes: Vec<u8> = entries.iter().map(|e| e.0).collect();
            let children = mk_slots::<7>();
            for (i, e) in entries.iter().enumerate() {
                children[i].store(e.1);
            }
            Body::ListNode {
                bytes: ByteList::new(PackedBytes::from_slice(&bytes)),
                children,
            }
        }
        Shape::Pop => {
            let b = Box::new(PopNodeBody {
                bits: Bitmap256::new(),
                children: mk_slots(),
            });
            for (i, e) in entries.iter().enumerate() {
                b.bits.set(e.0);
                b.children[i].store(e.1);
            }
            Body::PopNode(b)
        }
        Shape::Full => {
            let b = Box::new(FullNodeBody {
                bits: Bitmap256::new(),
                children: mk_slots(),
            });
            for e in entries {
                b.bits.set(e.0);
                b.children[e.0 as usize].store(e.1);
            }
            Body::FullNode(b)
        }
        Shape::Skip => unreachable!(),
    };

    alloc_node(
        heap,
        Node {
            header: header(shape, false, eos, poisoned),
            skip: Box::from(skip),
            eos: ValueCell::empty(),
            body,
        },
    )
}

/// Same shape and entry set as src, new skip, empty cells, children
/// borrowed.  Always poisoned: this is the speculative half of a
/// whole-node replacement.
pub fn clone_shell<V>(heap: &dyn Heap, src: &Node<V>, new_skip: &[u8]) -> Result<*mut Node<V>> {
    if src.is_leaf() {
        match &src.body {
            Body::SkipLeaf => skip_leaf(heap, new_skip, true),
            _ => leaf_with_bytes(heap, new_skip, &src.bytes(), true),
        }
    } else {
        let mut entries = Vec::with_capacity(src.fanout());
        src.each_child_word(|c, w| entries.push((c, w & !SLOT_TAGS)));
        node_with_children(heap, new_skip, &entries, src.has_eos(), true)
    }
}

//-------------------------------------------------------------------------
// Deep copy.  Caller holds the writer lock on the source tree, so slab
// pointers are stable and peek is sound.

pub fn deep_copy<V: Clone>(heap: &dyn Heap, word: u64) -> Result<u64> {
    let src = unsafe { &*((word & !SLOT_TAGS) as *const Node<V>) };

    let copy = if src.is_leaf() {
        match &src.body {
            Body::SkipLeaf => skip_leaf::<V>(heap, src.skip(), false)?,
            _ => {
                let p = leaf_with_bytes::<V>(heap, src.skip(), &src.bytes(), false)?;
                let fresh = unsafe { &*p };
                let mut failed = None;
                src.each_cell(|c, cell| {
                    if failed.is_some() {
                        return;
                    }
                    if let Some(v) = unsafe { cell.peek() } {
                        match crate::cell::alloc_slab(heap, v.clone()) {
                            Ok(slab) => fresh.cell_for(c).unwrap().init(slab as u64),
                            Err(e) => failed = Some(e),
                        }
                    }
                });
                if let Some(e) = failed {
                    unsafe { free_subtree(heap, p) };
                    return Err(e);
                }
                p
            }
        }
    } else {
        let mut entries = Vec::with_capacity(src.fanout());
        let mut failed = None;
        src.each_child_word(|c, w| {
            if failed.is_some() {
                return;
            }
            match deep_copy::<V>(heap, w) {
                Ok(nw) => entries.push((c, nw)),
                Err(e) => failed = Some(e),
            }
        });
        if let Some(e) = failed {
            for (_, w) in entries {
                unsafe { free_subtree(heap, w as *mut Node<V>) };
            }
            return Err(e);
        }
        node_with_children::<V>(heap, src.skip(), &entries, src.has_eos(), false)?
    };

    let fresh = unsafe { &*copy };
    if src.load_header() & FLAG_EOS != 0 {
        if let Some(v) = unsafe { src.eos.peek() } {
            match crate::cell::alloc_slab(heap, v.clone()) {
                Ok(slab) => fresh.eos.init(slab as u64),
                Err(e) => {
                    unsafe { free_subtree(heap, copy) };
                    return Err(e);
                }
            }
        }
    }

    Ok(copy as u64)
}

//-------------------------------------------------------------------------
// Deallocation.

/// Recursive teardown of a live subtree: remaining slabs, children, then
/// the node itself.  A poisoned node borrows its children, so recursion
/// stops there.
///
/// # Safety
///
/// No reader may still hold a reference anywhere under p.
pub unsafe fn free_subtree<V>(heap: &dyn Heap, p: *mut Node<V>) {
    let node = &*p;

    if node.is_poisoned() {
        debug_assert!(false, "live tree contains a poisoned node");
        dealloc_node(heap, p);
        return;
    }

    let eos = node.eos.pointer_word();
    if eos != 0 {
        free_slab::<V>(heap, eos as *mut u8);
    }

    node.each_cell(|_, cell| {
        let w = cell.pointer_word();
        if w != 0 {
            free_slab::<V>(heap, w as *mut u8);
        }
    });

    let mut children = Vec::new();
    node.each_child_word(|_, w| children.push(w & !SLOT_TAGS));
    for w in children {
        if w != 0 && w != retry_sentinel() {
            free_subtree(heap, w as *mut Node<V>);
        }
    }

    dealloc_node(heap, p);
}

/// Drop a speculative subtree after failed validation.  Fresh nodes are
/// poisoned and hold no slabs yet; their child slots mix other fresh
/// nodes with entries borrowed from the live tree, and only the former
/// are ours to free.
///
/// # Safety
///
/// p must be a never-published speculative node.
pub unsafe fn discard_speculative<V>(heap: &dyn Heap, p: *mut Node<V>) {
    let node = &*p;
    debug_assert!(node.is_poisoned());

    let mut children = Vec::new();
    node.each_child_word(|_, w| children.push(w & !SLOT_TAGS));
    for w in children {
        if w == 0 || w == retry_sentinel() {
            continue;
        }
        let child = w as *mut Node<V>;
        if (*child).is_poisoned() {
            discard_speculative(heap, child);
        }
    }

    dealloc_node(heap, p);
}

/// Shallow free for a retired victim: its values and children have moved
/// to the successor, and readers that were parked inside have drained by
/// the time reclamation runs this.
///
/// # Safety
///
/// p must be fully evacuated and past its grace period.
pub unsafe fn free_node<V>(heap: &dyn Heap, p: *mut Node<V>) {
    dealloc_node(heap, p);
}

//-------------------------------------
// Type-erased deleters handed to the reclamation queue.

pub unsafe fn free_node_erased<V>(p: *mut u8, heap: &dyn Heap) {
    free_node::<V>(heap, p as *mut Node<V>);
}

pub unsafe fn free_subtree_erased<V>(p: *mut u8, heap: &dyn Heap) {
    free_subtree::<V>(heap, p as *mut Node<V>);
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
