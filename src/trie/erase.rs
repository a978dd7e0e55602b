use std::sync::atomic::Ordering;
use tracing::trace;

use crate::heap::Result;
use crate::slot::SLOT_TAGS;
use crate::trie::builder::*;
use crate::trie::navigate::{match_skip, probe, Probe, SkipMatch, Step};
use crate::trie::node::*;
use crate::trie::Core;

//-------------------------------------------------------------------------

pub const ERASE_RETRIES: usize = 7;

enum EraseAttempt {
    Retry,
    Removed,
    Missing,
}

//-------------------------------------------------------------------------

impl<V: Clone> Core<V> {
    pub fn erase_bytes(&self, key: &[u8]) -> Result<bool> {
        let mut attempt = 0;
        loop {
            let pessimistic = attempt >= ERASE_RETRIES;
            if pessimistic {
                trace!(attempt, "erase: pessimistic fallback");
            }

            match self.erase_attempt(key, pessimistic)? {
                EraseAttempt::Retry => attempt += 1,
                EraseAttempt::Removed => return Ok(true),
                EraseAttempt::Missing => return Ok(false),
            }
        }
    }

    fn erase_attempt(&self, key: &[u8], pessimistic: bool) -> Result<EraseAttempt> {
        let _pin = self.reclaim.pin();
        let held = if pessimistic {
            Some(self.writer.lock().unwrap())
        } else {
            None
        };

        let path = match probe::<V>(&self.root, key) {
            Probe::EmptyRoot => return Ok(EraseAttempt::Missing),
            Probe::Retry => return Ok(EraseAttempt::Retry),
            Probe::Found { path } => path,
        };

        let target = path.last().unwrap();
        let t = unsafe { &*target.node };
        let rest = &key[target.entered..];

        match match_skip(t.skip(), rest) {
            SkipMatch::Diverge(_) | SkipMatch::KeyPrefix(_) => Ok(self.missing_if_settled(target)),

            SkipMatch::Exact => {
                if t.is_leaf() {
                    match &t.body {
                        Body::SkipLeaf => self.erase_detach(&path, key, held),
                        _ => Ok(self.missing_if_settled(target)),
                    }
                } else if !t.has_eos() {
                    Ok(self.missing_if_settled(target))
                } else if t.fanout() >= 2 {
                    Ok(self.erase_eos_in_place(&path, held))
                } else {
                    self.erase_eos_fuse(&path, held)
                }
            }

            SkipMatch::Through => {
                let tail = &rest[t.skip().len()..];
                let c = tail[0];

                if !t.is_leaf() || matches!(t.body, Body::SkipLeaf) {
                    // Interior lacking the child, or a skip leaf whose key
                    // is shorter than ours.
                    return Ok(self.missing_if_settled(target));
                }
                if tail.len() != 1 || t.cell_for(c).is_none() {
                    return Ok(self.missing_if_settled(target));
                }

                let n = t.fanout();
                if Shape::for_fanout(n - 1) == t.shape() {
                    Ok(self.erase_leaf_in_place(&path, c, held))
                } else if n - 1 == 1 {
                    self.erase_leaf_to_skip(&path, c, held)
                } else {
                    self.erase_leaf_shrink(&path, c, held)
                }
            }
        }
    }

    //---------------------------------

    // The key is absent; make sure the node we decided that on did not
    // move underneath us.
    fn missing_if_settled(&self, target: &Step<V>) -> EraseAttempt {
        if unsafe { &*target.node }.load_header() == target.header {
            EraseAttempt::Missing
        } else {
            EraseAttempt::Retry
        }
    }

    //---------------------------------
    // in-place commits

    fn erase_eos_in_place(
        &self,
        path: &[Step<V>],
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> EraseAttempt {
        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            return EraseAttempt::Retry;
        }

        let t = unsafe { &*path.last().unwrap().node };
        t.bump_version();
        let slab = t.eos.take();
        t.clear_eos_flag();
        t.bump_version();
        self.retire_slab(slab);
        self.count.fetch_sub(1, Ordering::Relaxed);
        EraseAttempt::Removed
    }

    fn erase_leaf_in_place(
        &self,
        path: &[Step<V>],
        c: u8,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> EraseAttempt {
        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            return EraseAttempt::Retry;
        }

        let t = unsafe { &*path.last().unwrap().node };
        t.bump_version();
        let slab = t.remove_terminal(c);
        t.bump_version();
        self.retire_slab(slab);
        self.count.fetch_sub(1, Ordering::Relaxed);
        EraseAttempt::Removed
    }

    //---------------------------------
    // whole-leaf removal: detach from the parent, then keep the parent
    // legal (shape minimality, no EOS-less single-child interior)

    fn erase_detach(
        &self,
        path: &[Step<V>],
        key: &[u8],
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<EraseAttempt> {
        if path.len() == 1 {
            // Last key in the tree.
            let guard = self.lock_and_validate(path, held);
            if guard.is_none() {
                return Ok(EraseAttempt::Retry);
            }
            let t = unsafe { &*path[0].node };
            t.bump_version();
            let slab = t.eos.take();
            self.root.store_sentinel();
            self.root.store(0);
            self.retire_slab(slab);
            self.retire_node(path[0].node);
            self.count.fetch_sub(1, Ordering::Relaxed);
            return Ok(EraseAttempt::Removed);
        }

        let target = path.last().unwrap();
        let parent = &path[path.len() - 2];
        let p = unsafe { &*parent.node };
        let edge = key[target.entered - 1];
        let n = p.fanout();

        if n == 1 {
            // Single-child interior: it carried an EOS (or it could not
            // have existed), so it becomes a skip leaf.
            return self.erase_parent_to_leaf(path, held);
        }
        if n == 2 && !p.has_eos() {
            return self.erase_fuse_sibling(path, edge, held);
        }
        if Shape::for_fanout(n - 1) == p.shape() {
            return Ok(self.erase_child_in_place(path, edge, held));
        }
        self.erase_parent_shrink(path, edge, held)
    }

    fn erase_child_in_place(
        &self,
        path: &[Step<V>],
        edge: u8,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> EraseAttempt {
        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            return EraseAttempt::Retry;
        }

        let t = unsafe { &*path.last().unwrap().node };
        let p = unsafe { &*path[path.len() - 2].node };

        t.bump_version();
        let slab = t.eos.take();
        p.bump_version();
        p.remove_child(edge);
        p.bump_version();

        self.retire_slab(slab);
        self.retire_node(path.last().unwrap().node);
        self.count.fetch_sub(1, Ordering::Relaxed);
        EraseAttempt::Removed
    }

    // Parent drops below its shape's band: rebuild it one shape down
    // without the dying edge.
    fn erase_parent_shrink(
        &self,
        path: &[Step<V>],
        edge: u8,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<EraseAttempt> {
        let parent_path = &path[..path.len() - 1];
        let p = unsafe { &*parent_path.last().unwrap().node };

        let mut entries: Vec<(u8, u64)> = Vec::with_capacity(p.fanout());
        p.each_child_word(|b, w| {
            if b != edge {
                entries.push((b, w & !SLOT_TAGS));
            }
        });

        let fresh =
            node_with_children::<V>(self.heap.as_ref(), p.skip(), &entries, p.has_eos(), true)?;

        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            unsafe { discard_speculative(self.heap.as_ref(), fresh) };
            return Ok(EraseAttempt::Retry);
        }

        let t = unsafe { &*path.last().unwrap().node };
        unsafe {
            t.bump_version();
            let slab = t.eos.take();
            p.bump_version();
            if p.has_eos() {
                (*fresh).eos.init(p.eos.take());
            }
            (*fresh).clear_poison();
            self.swing_slot(parent_path, fresh as u64, &[parent_path.last().unwrap().node]);
            self.retire_node(path.last().unwrap().node);
            self.retire_slab(slab);
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        Ok(EraseAttempt::Removed)
    }

    // Single-child parent loses that child; its EOS is the only key left
    // under it, so it collapses into a skip leaf.
    fn erase_parent_to_leaf(
        &self,
        path: &[Step<V>],
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<EraseAttempt> {
        let parent_path = &path[..path.len() - 1];
        let p = unsafe { &*parent_path.last().unwrap().node };
        debug_assert!(p.has_eos());

        let fresh = skip_leaf::<V>(self.heap.as_ref(), p.skip(), true)?;

        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            unsafe { discard_speculative(self.heap.as_ref(), fresh) };
            return Ok(EraseAttempt::Retry);
        }

        let t = unsafe { &*path.last().unwrap().node };
        unsafe {
            t.bump_version();
            let slab = t.eos.take();
            p.bump_version();
            (*fresh).eos.init(p.eos.take());
            (*fresh).clear_poison();
            self.swing_slot(parent_path, fresh as u64, &[parent_path.last().unwrap().node]);
            self.retire_node(path.last().unwrap().node);
            self.retire_slab(slab);
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        Ok(EraseAttempt::Removed)
    }

    // Two-child EOS-less parent loses one child: fuse it with the
    // survivor into a single node whose skip is parent skip + edge byte +
    // survivor skip.
    fn erase_fuse_sibling(
        &self,
        path: &[Step<V>],
        edge: u8,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<EraseAttempt> {
        let parent_path = &path[..path.len() - 1];
        let p = unsafe { &*parent_path.last().unwrap().node };

        let mut survivor: Option<(u8, u64)> = None;
        p.each_child_word(|b, w| {
            if b != edge {
                survivor = Some((b, w & !SLOT_TAGS));
            }
        });
        let (d, cw) = match survivor {
            Some(s) => s,
            None => return Ok(EraseAttempt::Retry),
        };

        let c_slot = match p.child_slot(d) {
            Some(s) => s as *const crate::slot::Slot,
            None => return Ok(EraseAttempt::Retry),
        };
        let c = unsafe { &*(cw as *const Node<V>) };
        let c_header = c.load_header();
        if c_header & FLAG_POISON != 0 || version_busy(c_header) {
            return Ok(EraseAttempt::Retry);
        }

        let mut new_skip = Vec::with_capacity(p.skip().len() + 1 + c.skip().len());
        new_skip.extend_from_slice(p.skip());
        new_skip.push(d);
        new_skip.extend_from_slice(c.skip());

        let fused = clone_shell(self.heap.as_ref(), c, &new_skip)?;

        // The survivor is off the probe path, so it gets its own
        // validation entry.
        let mut checked = parent_path.to_vec();
        checked.push(path[path.len() - 1]);
        checked.push(Step {
            node: cw as *mut Node<V>,
            header: c_header,
            slot: c_slot,
            slot_word: cw,
            entered: 0,
        });

        let guard = self.lock_and_validate(&checked, held);
        if guard.is_none() {
            unsafe { discard_speculative(self.heap.as_ref(), fused) };
            return Ok(EraseAttempt::Retry);
        }

        let t = unsafe { &*path.last().unwrap().node };
        unsafe {
            t.bump_version();
            let slab = t.eos.take();
            p.bump_version();
            c.bump_version();
            self.move_payload(c, &*fused);
            (*fused).clear_poison();
            self.swing_slot(parent_path, fused as u64, &[parent_path.last().unwrap().node]);
            self.retire_node(cw as *mut Node<V>);
            self.retire_node(path.last().unwrap().node);
            self.retire_slab(slab);
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        Ok(EraseAttempt::Removed)
    }

    // EOS removed from a single-child interior: fuse it with its sole
    // child.
    fn erase_eos_fuse(
        &self,
        path: &[Step<V>],
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<EraseAttempt> {
        let t = unsafe { &*path.last().unwrap().node };

        let (edge, c_slot, cw) = match &t.body {
            Body::SkipNode { edge, child } => {
                let w = child.load();
                if w == 0 || w & SLOT_TAGS != 0 || w == crate::slot::retry_sentinel() {
                    return Ok(EraseAttempt::Retry);
                }
                (*edge, child as *const crate::slot::Slot, w)
            }
            _ => return Ok(EraseAttempt::Retry),
        };

        let c = unsafe { &*(cw as *const Node<V>) };
        let c_header = c.load_header();
        if c_header & FLAG_POISON != 0 || version_busy(c_header) {
            return Ok(EraseAttempt::Retry);
        }

        let mut new_skip = Vec::with_capacity(t.skip().len() + 1 + c.skip().len());
        new_skip.extend_from_slice(t.skip());
        new_skip.push(edge);
        new_skip.extend_from_slice(c.skip());

        let fused = clone_shell(self.heap.as_ref(), c, &new_skip)?;

        let mut checked = path.to_vec();
        checked.push(Step {
            node: cw as *mut Node<V>,
            header: c_header,
            slot: c_slot,
            slot_word: cw,
            entered: 0,
        });

        let guard = self.lock_and_validate(&checked, held);
        if guard.is_none() {
            unsafe { discard_speculative(self.heap.as_ref(), fused) };
            return Ok(EraseAttempt::Retry);
        }

        unsafe {
            t.bump_version();
            let slab = t.eos.take();
            c.bump_version();
            self.move_payload(c, &*fused);
            (*fused).clear_poison();
            self.swing_slot(path, fused as u64, &[path.last().unwrap().node]);
            self.retire_node(cw as *mut Node<V>);
            self.retire_slab(slab);
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        Ok(EraseAttempt::Removed)
    }

    //---------------------------------
    // leaf shape shrinks

    // Binary leaf down to one terminal: the survivor folds into the skip
    // and the node becomes a skip leaf.
    fn erase_leaf_to_skip(
        &self,
        path: &[Step<V>],
        c: u8,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<EraseAttempt> {
        let t = unsafe { &*path.last().unwrap().node };

        let bytes = t.bytes();
        let d = if bytes[0] == c { bytes[1] } else { bytes[0] };

        let mut new_skip = Vec::with_capacity(t.skip().len() + 1);
        new_skip.extend_from_slice(t.skip());
        new_skip.push(d);

        let fresh = skip_leaf::<V>(self.heap.as_ref(), &new_skip, true)?;

        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            unsafe { discard_speculative(self.heap.as_ref(), fresh) };
            return Ok(EraseAttempt::Retry);
        }

        unsafe {
            t.bump_version();
            let slab = t.cell_for(c).unwrap().take();
            (*fresh).eos.init(t.cell_for(d).unwrap().take());
            (*fresh).clear_poison();
            self.swing_slot(path, fresh as u64, &[path.last().unwrap().node]);
            self.retire_slab(slab);
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        Ok(EraseAttempt::Removed)
    }

    fn erase_leaf_shrink(
        &self,
        path: &[Step<V>],
        c: u8,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<EraseAttempt> {
        let t = unsafe { &*path.last().unwrap().node };

        let bytes: Vec<u8> = t.bytes().into_iter().filter(|&b| b != c).collect();
        let fresh = leaf_with_bytes::<V>(self.heap.as_ref(), t.skip(), &bytes, true)?;

        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            unsafe { discard_speculative(self.heap.as_ref(), fresh) };
            return Ok(EraseAttempt::Retry);
        }

        unsafe {
            t.bump_version();
            let slab = t.cell_for(c).unwrap().take();
            let f = &*fresh;
            t.each_cell(|b, cell| {
                if b != c {
                    f.cell_for(b).unwrap().init(cell.take());
                }
            });
            f.clear_poison();
            self.swing_slot(path, fresh as u64, &[path.last().unwrap().node]);
            self.retire_slab(slab);
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        Ok(EraseAttempt::Removed)
    }

}

//-------------------------------------------------------------------------
