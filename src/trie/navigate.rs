use crate::cell::CellRead;
use crate::slot::{retry_sentinel, Slot, SlotRead, SLOT_TAGS};
use crate::trie::node::*;

//-------------------------------------------------------------------------

/// # Safety
///
/// word must name a node that is live or retired-but-unreclaimed, which
/// the caller guarantees by holding an epoch guard (or by being the only
/// thread in a single-threaded trie).
pub unsafe fn deref<'a, V>(word: u64) -> &'a Node<V> {
    &*((word & !SLOT_TAGS) as *const Node<V>)
}

//-------------------------------------------------------------------------

/// How a node's skip bytes line up against the remaining key.
pub enum SkipMatch {
    /// Key consumed exactly at the end of the skip.
    Exact,
    /// Skip fully matched, key continues.
    Through,
    /// Key ran out inside the skip; the common length is the whole key.
    KeyPrefix(usize),
    /// Mismatch at the given common length.
    Diverge(usize),
}

pub fn match_skip(skip: &[u8], key: &[u8]) -> SkipMatch {
    let max = skip.len().min(key.len());
    let mut m = 0;
    while m < max && skip[m] == key[m] {
        m += 1;
    }

    if m == skip.len() {
        if m == key.len() {
            SkipMatch::Exact
        } else {
            SkipMatch::Through
        }
    } else if m == key.len() {
        SkipMatch::KeyPrefix(m)
    } else {
        SkipMatch::Diverge(m)
    }
}

fn settled<V>(node: &Node<V>, h: u64) -> bool {
    node.load_header() == h
}

//-------------------------------------------------------------------------
// Reader-side lookup.  Lock-free: any conflict (tag bit, sentinel,
// poisoned header, version movement, cell claimed by a writer) restarts
// from the root, because the ancestor chain may have been rebuilt since
// the descent began.

pub fn lookup<V: Clone>(root: &Slot, key: &[u8]) -> Option<V> {
    'restart: loop {
        let mut w = match root.read() {
            SlotRead::Null => return None,
            SlotRead::Retry => continue 'restart,
            SlotRead::Ptr(w) => w,
        };
        let mut pos = 0;

        loop {
            let node = unsafe { deref::<V>(w) };
            let h = node.load_header();
            if h & FLAG_POISON != 0 || version_busy(h) {
                continue 'restart;
            }

            let rest = &key[pos..];
            match match_skip(node.skip(), rest) {
                SkipMatch::Diverge(_) | SkipMatch::KeyPrefix(_) => {
                    if !settled(node, h) {
                        continue 'restart;
                    }
                    return None;
                }

                SkipMatch::Exact => {
                    // Key terminates here: skip-leaf value or interior EOS.
                    let terminal = if h & FLAG_LEAF != 0 {
                        matches!(node.body, Body::SkipLeaf)
                    } else {
                        h & FLAG_EOS != 0
                    };
                    if !terminal {
                        if !settled(node, h) {
                            continue 'restart;
                        }
                        return None;
                    }
                    match node.eos.try_read() {
                        CellRead::Value(v) => {
                            if !settled(node, h) {
                                continue 'restart;
                            }
                            return Some(v);
                        }
                        _ => continue 'restart,
                    }
                }

                SkipMatch::Through => {
                    let tail = &rest[node.skip().len()..];
                    let c = tail[0];

                    if h & FLAG_LEAF != 0 {
                        if tail.len() != 1 {
                            if !settled(node, h) {
                                continue 'restart;
                            }
                            return None;
                        }
                        match node.cell_for(c) {
                            Some(cell) => match cell.try_read() {
                                CellRead::Value(v) => {
                                    if !settled(node, h) {
                                        continue 'restart;
                                    }
                                    return Some(v);
                                }
                                CellRead::Empty => {
                                    if !settled(node, h) {
                                        continue 'restart;
                                    }
                                    return None;
                                }
                                CellRead::Conflict => continue 'restart,
                            },
                            None => {
                                if !settled(node, h) {
                                    continue 'restart;
                                }
                                return None;
                            }
                        }
                    } else {
                        match node.child_slot(c) {
                            Some(s) => {
                                let w1 = s.load();
                                if w1 == 0 || w1 & SLOT_TAGS != 0 || w1 == retry_sentinel() {
                                    continue 'restart;
                                }
                                // The pointer must not have been swapped
                                // between observation and use.
                                if s.load() != w1 {
                                    continue 'restart;
                                }
                                if !settled(node, h) {
                                    continue 'restart;
                                }
                                pos += node.skip().len() + 1;
                                w = w1;
                            }
                            None => {
                                if !settled(node, h) {
                                    continue 'restart;
                                }
                                return None;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Presence test.  Skips the value-cell read protocol entirely: it only
/// needs the cell's pointer bits, so it never takes the READ claim.
pub fn contains<V>(root: &Slot, key: &[u8]) -> bool {
    'restart: loop {
        let mut w = match root.read() {
            SlotRead::Null => return false,
            SlotRead::Retry => continue 'restart,
            SlotRead::Ptr(w) => w,
        };
        let mut pos = 0;

        loop {
            let node = unsafe { deref::<V>(w) };
            let h = node.load_header();
            if h & FLAG_POISON != 0 || version_busy(h) {
                continue 'restart;
            }

            let rest = &key[pos..];
            match match_skip(node.skip(), rest) {
                SkipMatch::Diverge(_) | SkipMatch::KeyPrefix(_) => {
                    if !settled(node, h) {
                        continue 'restart;
                    }
                    return false;
                }

                SkipMatch::Exact => {
                    let present = if h & FLAG_LEAF != 0 {
                        matches!(node.body, Body::SkipLeaf)
                    } else {
                        h & FLAG_EOS != 0
                    };
                    if present && node.eos.is_locked() {
                        continue 'restart;
                    }
                    if !settled(node, h) {
                        continue 'restart;
                    }
                    return present;
                }

                SkipMatch::Through => {
                    let tail = &rest[node.skip().len()..];
                    let c = tail[0];

                    if h & FLAG_LEAF != 0 {
                        let present = tail.len() == 1
                            && match node.cell_for(c) {
                                Some(cell) => {
                                    if cell.is_locked() {
                                        continue 'restart;
                                    }
                                    cell.is_present()
                                }
                                None => false,
                            };
                        if !settled(node, h) {
                            continue 'restart;
                        }
                        return present;
                    }

                    match node.child_slot(c) {
                        Some(s) => {
                            let w1 = s.load();
                            if w1 == 0 || w1 & SLOT_TAGS != 0 || w1 == retry_sentinel() {
                                continue 'restart;
                            }
                            if s.load() != w1 {
                                continue 'restart;
                            }
                            if !settled(node, h) {
                                continue 'restart;
                            }
                            pos += node.skip().len() + 1;
                            w = w1;
                        }
                        None => {
                            if !settled(node, h) {
                                continue 'restart;
                            }
                            return false;
                        }
                    }
                }
            }
        }
    }
}

//-------------------------------------------------------------------------
// Leftmost live pair, for begin().  An EOS sorts before any child of the
// same node, shorter keys being lexicographically smaller.

pub fn first_pair<V: Clone>(root: &Slot) -> Option<(Vec<u8>, V)> {
    'restart: loop {
        let mut w = match root.read() {
            SlotRead::Null => return None,
            SlotRead::Retry => continue 'restart,
            SlotRead::Ptr(w) => w,
        };
        let mut bytes = Vec::new();

        loop {
            let node = unsafe { deref::<V>(w) };
            let h = node.load_header();
            if h & FLAG_POISON != 0 || version_busy(h) {
                bytes.clear();
                continue 'restart;
            }

            bytes.extend_from_slice(node.skip());

            if h & FLAG_LEAF != 0 {
                match &node.body {
                    Body::SkipLeaf => match node.eos.try_read() {
                        CellRead::Value(v) => {
                            if !settled(node, h) {
                                bytes.clear();
                                continue 'restart;
                            }
                            return Some((bytes, v));
                        }
                        _ => {
                            bytes.clear();
                            continue 'restart;
                        }
                    },
                    _ => {
                        let c = match node.first_byte() {
                            Some(c) => c,
                            None => {
                                bytes.clear();
                                continue 'restart;
                            }
                        };
                        match node.cell_for(c).map(|cell| cell.try_read()) {
                            Some(CellRead::Value(v)) => {
                                if !settled(node, h) {
                                    bytes.clear();
                                    continue 'restart;
                                }
                                bytes.push(c);
                                return Some((bytes, v));
                            }
                            _ => {
                                bytes.clear();
                                continue 'restart;
                            }
                        }
                    }
                }
            }

            if h & FLAG_EOS != 0 {
                match node.eos.try_read() {
                    CellRead::Value(v) => {
                        if !settled(node, h) {
                            bytes.clear();
                            continue 'restart;
                        }
                        return Some((bytes, v));
                    }
                    _ => {
                        bytes.clear();
                        continue 'restart;
                    }
                }
            }

            let c = match node.first_byte() {
                Some(c) => c,
                None => {
                    bytes.clear();
                    continue 'restart;
                }
            };
            match node.child_slot(c) {
                Some(s) => {
                    let w1 = s.load();
                    if w1 == 0 || w1 & SLOT_TAGS != 0 || w1 == retry_sentinel() {
                        bytes.clear();
                        continue 'restart;
                    }
                    if s.load() != w1 {
                        bytes.clear();
                        continue 'restart;
                    }
                    if !settled(node, h) {
                        bytes.clear();
                        continue 'restart;
                    }
                    bytes.push(c);
                    w = w1;
                }
                None => {
                    bytes.clear();
                    continue 'restart;
                }
            }
        }
    }
}

//-------------------------------------------------------------------------
// Writer-side probe: the same descent, but capturing the ancestor chain
// as (node, header, slot, slot word) so it can be revalidated under the
// writer lock.

pub struct Step<V> {
    pub node: *mut Node<V>,
    pub header: u64,
    pub slot: *const Slot,
    pub slot_word: u64,
    /// Offset into the key at which this node was entered.
    pub entered: usize,
}

impl<V> Clone for Step<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Step<V> {}

pub enum Probe<V> {
    EmptyRoot,
    Retry,
    /// Descent stopped at path.last(): a leaf, a skip mismatch, an
    /// exhausted key, or an interior lacking the wanted child.
    Found { path: Vec<Step<V>> },
}

pub fn probe<V>(root: &Slot, key: &[u8]) -> Probe<V> {
    let mut w = match root.read() {
        SlotRead::Null => return Probe::EmptyRoot,
        SlotRead::Retry => return Probe::Retry,
        SlotRead::Ptr(w) => w,
    };
    let mut slot: *const Slot = root;
    let mut pos = 0;
    let mut path = Vec::new();

    loop {
        let node = (w & !SLOT_TAGS) as *mut Node<V>;
        let n = unsafe { &*node };
        let h = n.load_header();
        if h & FLAG_POISON != 0 || version_busy(h) {
            return Probe::Retry;
        }

        path.push(Step {
            node,
            header: h,
            slot,
            slot_word: w,
            entered: pos,
        });

        let rest = &key[pos..];
        if let SkipMatch::Through = match_skip(n.skip(), rest) {
            if h & FLAG_LEAF == 0 {
                let c = rest[n.skip().len()];
                if let Some(s) = n.child_slot(c) {
                    let w1 = s.load();
                    if w1 == 0 || w1 & SLOT_TAGS != 0 || w1 == retry_sentinel() {
                        return Probe::Retry;
                    }
                    if s.load() != w1 {
                        return Probe::Retry;
                    }
                    if n.load_header() != h {
                        return Probe::Retry;
                    }
                    pos += n.skip().len() + 1;
                    slot = s as *const Slot;
                    w = w1;
                    continue;
                }
            }
        }

        return Probe::Found { path };
    }
}

//-------------------------------------------------------------------------
