use std::sync::atomic::Ordering;
use tracing::trace;

use crate::cell::{alloc_slab, free_slab};
use crate::heap::Result;
use crate::trie::builder::*;
use crate::trie::navigate::{match_skip, probe, Probe, SkipMatch, Step};
use crate::trie::node::*;
use crate::trie::Core;

//-------------------------------------------------------------------------

// Speculative attempts before the engine gives up and probes under the
// lock, where validation cannot fail.
pub const INSERT_RETRIES: usize = 7;

pub enum Attempt<V> {
    Retry,
    Inserted,
    Present(V),
}

//-------------------------------------------------------------------------

impl<V: Clone> Core<V> {
    pub fn insert_bytes(&self, key: &[u8], value: V) -> Result<(V, bool)> {
        let snapshot = value.clone();
        let slab = alloc_slab(self.heap.as_ref(), value)? as u64;

        let mut attempt = 0;
        loop {
            let pessimistic = attempt >= INSERT_RETRIES;
            if pessimistic {
                trace!(attempt, "insert: pessimistic fallback");
            }

            match self.insert_attempt(key, slab, pessimistic) {
                Ok(Attempt::Inserted) => return Ok((snapshot, true)),
                Ok(Attempt::Present(v)) => {
                    unsafe { free_slab::<V>(self.heap.as_ref(), slab as *mut u8) };
                    return Ok((v, false));
                }
                Ok(Attempt::Retry) => attempt += 1,
                Err(e) => {
                    unsafe { free_slab::<V>(self.heap.as_ref(), slab as *mut u8) };
                    return Err(e);
                }
            }
        }
    }

    // One pass of the probe / validate / commit pipeline.  The slab is
    // consumed exactly when Ok(Inserted) is returned.
    fn insert_attempt(&self, key: &[u8], slab: u64, pessimistic: bool) -> Result<Attempt<V>> {
        let _pin = self.reclaim.pin();
        let held = if pessimistic {
            Some(self.writer.lock().unwrap())
        } else {
            None
        };

        let path = match probe::<V>(&self.root, key) {
            Probe::EmptyRoot => {
                let leaf = skip_leaf::<V>(self.heap.as_ref(), key, true)?;
                let _lock = match held {
                    Some(g) => g,
                    None => self.writer.lock().unwrap(),
                };
                if self.root.load() != 0 {
                    self.discard(leaf);
                    return Ok(Attempt::Retry);
                }
                let fresh = unsafe { &*leaf };
                fresh.eos.init(slab);
                fresh.clear_poison();
                self.root.store(leaf as u64);
                self.count.fetch_add(1, Ordering::Relaxed);
                return Ok(Attempt::Inserted);
            }
            Probe::Retry => return Ok(Attempt::Retry),
            Probe::Found { path } => path,
        };

        let target = path.last().unwrap();
        let t = unsafe { &*target.node };
        let rest = &key[target.entered..];

        match match_skip(t.skip(), rest) {
            SkipMatch::Diverge(m) => self.insert_split(&path, rest, m, slab, held),
            SkipMatch::KeyPrefix(m) => self.insert_prefix(&path, rest, m, slab, held),
            SkipMatch::Exact => {
                if t.is_leaf() {
                    match &t.body {
                        Body::SkipLeaf => self.report_present(&path, None, held),
                        _ => self.insert_deepen(&path, rest, None, slab, held),
                    }
                } else if t.has_eos() {
                    self.report_present(&path, None, held)
                } else {
                    self.insert_eos_in_place(&path, slab, held)
                }
            }
            SkipMatch::Through => {
                let tail = &rest[t.skip().len()..];
                let c = tail[0];

                if t.is_leaf() {
                    match &t.body {
                        Body::SkipLeaf => self.insert_extend(&path, tail, slab, held),
                        _ => {
                            let have = t.cell_for(c).is_some();
                            if have && tail.len() == 1 {
                                self.report_present(&path, Some(c), held)
                            } else if !have && tail.len() == 1 {
                                if t.has_room() {
                                    self.insert_leaf_in_place(&path, c, slab, held)
                                } else {
                                    self.insert_grow_leaf(&path, c, slab, held)
                                }
                            } else {
                                self.insert_deepen(&path, rest, Some(tail), slab, held)
                            }
                        }
                    }
                } else if t.has_room() {
                    self.insert_child_in_place(&path, tail, slab, held)
                } else {
                    self.insert_grow_node(&path, tail, slab, held)
                }
            }
        }
    }

    //---------------------------------
    // Shared plumbing

    fn discard(&self, p: *mut Node<V>) {
        unsafe { discard_speculative(self.heap.as_ref(), p) };
    }

    pub(crate) fn retire_node(&self, p: *mut Node<V>) {
        unsafe {
            self.reclaim
                .defer(p as *mut u8, free_node_erased::<V>, &self.heap)
        };
    }

    pub(crate) fn retire_slab(&self, w: u64) {
        unsafe {
            self.reclaim
                .defer(w as *mut u8, crate::cell::free_slab_erased::<V>, &self.heap)
        };
    }

    /// Re-check every captured (node, version) and slot pointer.  Any
    /// mismatch means a writer got in since the probe.
    pub(crate) fn validate(&self, path: &[Step<V>]) -> bool {
        for s in path {
            if unsafe { &*s.slot }.load() != s.slot_word {
                return false;
            }
            if unsafe { &*s.node }.load_header() != s.header {
                return false;
            }
        }
        true
    }

    /// Swing the target's slot to the replacement: bump the slot owner's
    /// version so mid-descent readers retry, park the sentinel across the
    /// swap, then retire the victims.
    pub(crate) unsafe fn swing_slot(&self, path: &[Step<V>], fresh: u64, victims: &[*mut Node<V>]) {
        let owner = if path.len() >= 2 {
            let owner = &*path[path.len() - 2].node;
            owner.bump_version();
            Some(owner)
        } else {
            None
        };
        let target = path.last().unwrap();
        let slot = &*target.slot;
        slot.store_sentinel();
        slot.store(fresh);
        if let Some(owner) = owner {
            owner.bump_version();
        }
        for &v in victims {
            self.retire_node(v);
        }
    }

    pub(crate) fn lock_and_validate<'a>(
        &'a self,
        path: &[Step<V>],
        held: Option<std::sync::MutexGuard<'a, ()>>,
    ) -> Option<std::sync::MutexGuard<'a, ()>> {
        let guard = match held {
            Some(g) => g,
            None => self.writer.lock().unwrap(),
        };
        if self.validate(path) {
            Some(guard)
        } else {
            None
        }
    }

    //---------------------------------
    // already present: confirm under the lock and snapshot the value

    fn report_present(
        &self,
        path: &[Step<V>],
        byte: Option<u8>,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<Attempt<V>> {
        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            return Ok(Attempt::Retry);
        }

        let t = unsafe { &*path.last().unwrap().node };
        let cell = match byte {
            Some(c) => t.cell_for(c),
            None => Some(&t.eos),
        };
        match cell.and_then(|cell| unsafe { cell.peek() }) {
            Some(v) => Ok(Attempt::Present(v.clone())),
            None => Ok(Attempt::Retry),
        }
    }

    //---------------------------------
    // in-place commits

    fn insert_eos_in_place(
        &self,
        path: &[Step<V>],
        slab: u64,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<Attempt<V>> {
        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            return Ok(Attempt::Retry);
        }

        let t = unsafe { &*path.last().unwrap().node };
        t.bump_version();
        let old = t.eos.replace(slab);
        debug_assert_eq!(old, 0);
        t.set_eos_flag();
        t.bump_version();
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Inserted)
    }

    fn insert_leaf_in_place(
        &self,
        path: &[Step<V>],
        c: u8,
        slab: u64,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<Attempt<V>> {
        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            return Ok(Attempt::Retry);
        }

        let t = unsafe { &*path.last().unwrap().node };
        t.bump_version();
        t.add_terminal(c, slab);
        t.bump_version();
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Inserted)
    }

    fn insert_child_in_place(
        &self,
        path: &[Step<V>],
        tail: &[u8],
        slab: u64,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<Attempt<V>> {
        let leaf = skip_leaf::<V>(self.heap.as_ref(), &tail[1..], true)?;

        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            self.discard(leaf);
            return Ok(Attempt::Retry);
        }

        let fresh = unsafe { &*leaf };
        fresh.eos.init(slab);
        fresh.clear_poison();

        let t = unsafe { &*path.last().unwrap().node };
        t.bump_version();
        t.add_child(tail[0], leaf as u64);
        t.bump_version();
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Inserted)
    }

    //---------------------------------
    // structural commits

    // Divergence inside the skip: a fresh interior over the common prefix
    // with the shortened old node on one side and a new skip leaf on the
    // other.  When both sides are skip-leaf keys ending exactly one byte
    // past the common prefix, they pack into a two-byte terminal set
    // instead, which is what lets runs of sibling keys build LIST, POP
    // and FULL leaves.
    fn insert_split(
        &self,
        path: &[Step<V>],
        rest: &[u8],
        m: usize,
        slab: u64,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<Attempt<V>> {
        let t = unsafe { &*path.last().unwrap().node };
        let old_byte = t.skip()[m];
        let new_byte = rest[m];

        if matches!(t.body, Body::SkipLeaf) && t.skip().len() == m + 1 && rest.len() == m + 1 {
            return self.insert_split_packed(path, rest, m, slab, held);
        }

        let clone = clone_shell(self.heap.as_ref(), t, &t.skip()[m + 1..])?;
        let leaf = match skip_leaf::<V>(self.heap.as_ref(), &rest[m + 1..], true) {
            Ok(p) => p,
            Err(e) => {
                self.discard(clone);
                return Err(e);
            }
        };

        let mut entries = [(old_byte, clone as u64), (new_byte, leaf as u64)];
        entries.sort_unstable_by_key(|e| e.0);
        let parent =
            match node_with_children::<V>(self.heap.as_ref(), &rest[..m], &entries, false, true) {
                Ok(p) => p,
                Err(e) => {
                    self.discard(clone);
                    self.discard(leaf);
                    return Err(e);
                }
            };

        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            self.discard(parent);
            return Ok(Attempt::Retry);
        }

        unsafe {
            t.bump_version();
            self.move_payload(t, &*clone);
            (*leaf).eos.init(slab);
            (*clone).clear_poison();
            (*leaf).clear_poison();
            (*parent).clear_poison();
            self.swing_slot(path, parent as u64, &[path.last().unwrap().node]);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Inserted)
    }

    // Both diverging keys end one byte past the common prefix: a binary
    // leaf over the two terminal bytes.
    fn insert_split_packed(
        &self,
        path: &[Step<V>],
        rest: &[u8],
        m: usize,
        slab: u64,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<Attempt<V>> {
        let t = unsafe { &*path.last().unwrap().node };
        let old_byte = t.skip()[m];
        let new_byte = rest[m];

        let mut bytes = [old_byte, new_byte];
        bytes.sort_unstable();
        let fresh = leaf_with_bytes::<V>(self.heap.as_ref(), &rest[..m], &bytes, true)?;

        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            self.discard(fresh);
            return Ok(Attempt::Retry);
        }

        unsafe {
            t.bump_version();
            let f = &*fresh;
            f.cell_for(old_byte).unwrap().init(t.eos.take());
            f.cell_for(new_byte).unwrap().init(slab);
            f.clear_poison();
            self.swing_slot(path, fresh as u64, &[path.last().unwrap().node]);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Inserted)
    }

    // Key exhausted inside the skip: the new value becomes the EOS of a
    // fresh single-child interior above the shortened old node.
    fn insert_prefix(
        &self,
        path: &[Step<V>],
        rest: &[u8],
        m: usize,
        slab: u64,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<Attempt<V>> {
        let t = unsafe { &*path.last().unwrap().node };
        let edge = t.skip()[m];

        let clone = clone_shell(self.heap.as_ref(), t, &t.skip()[m + 1..])?;
        let parent = match skip_node::<V>(self.heap.as_ref(), rest, edge, clone as u64, true) {
            Ok(p) => p,
            Err(e) => {
                self.discard(clone);
                return Err(e);
            }
        };

        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            self.discard(parent);
            return Ok(Attempt::Retry);
        }

        unsafe {
            t.bump_version();
            self.move_payload(t, &*clone);
            (*parent).eos.init(slab);
            (*clone).clear_poison();
            (*parent).clear_poison();
            self.swing_slot(path, parent as u64, &[path.last().unwrap().node]);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Inserted)
    }

    // Skip leaf whose key the new key extends: the old value becomes the
    // EOS of a fresh interior, the new tail a skip-leaf child.
    fn insert_extend(
        &self,
        path: &[Step<V>],
        tail: &[u8],
        slab: u64,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<Attempt<V>> {
        let t = unsafe { &*path.last().unwrap().node };

        let leaf = skip_leaf::<V>(self.heap.as_ref(), &tail[1..], true)?;
        let parent = match skip_node::<V>(self.heap.as_ref(), t.skip(), tail[0], leaf as u64, true)
        {
            Ok(p) => p,
            Err(e) => {
                self.discard(leaf);
                return Err(e);
            }
        };

        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            self.discard(parent);
            return Ok(Attempt::Retry);
        }

        unsafe {
            t.bump_version();
            (*parent).eos.init(t.eos.take());
            (*leaf).eos.init(slab);
            (*leaf).clear_poison();
            (*parent).clear_poison();
            self.swing_slot(path, parent as u64, &[path.last().unwrap().node]);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Inserted)
    }

    // A multi leaf gains a key that does not stop one byte past the skip:
    // the leaf becomes an interior whose terminal bytes turn into
    // empty-skip leaves.  deeper is None when the new key ends exactly at
    // path + skip (it becomes the interior's EOS), otherwise it is the
    // tail starting at the branch byte.
    fn insert_deepen(
        &self,
        path: &[Step<V>],
        _rest: &[u8],
        deeper: Option<&[u8]>,
        slab: u64,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<Attempt<V>> {
        let t = unsafe { &*path.last().unwrap().node };
        let old_bytes = t.bytes();

        // One fresh node per old terminal byte, plus possibly a chain for
        // the deeper key.
        let mut fresh: Vec<(u8, *mut Node<V>)> = Vec::with_capacity(old_bytes.len() + 1);
        let cleanup = |list: &Vec<(u8, *mut Node<V>)>, core: &Self| {
            for (_, p) in list {
                core.discard(*p);
            }
        };

        let branch = deeper.map(|d| d[0]);
        let mut new_leaf: *mut Node<V> = std::ptr::null_mut();

        for &b in &old_bytes {
            let child = if Some(b) == branch {
                // Old value at path+skip+b plus the new deeper key: an
                // EOS-bearing single-child interior.
                let d = deeper.unwrap();
                match skip_leaf::<V>(self.heap.as_ref(), &d[2..], true) {
                    Ok(leaf) => {
                        new_leaf = leaf;
                        match skip_node::<V>(self.heap.as_ref(), &[], d[1], leaf as u64, true) {
                            Ok(p) => p,
                            Err(e) => {
                                self.discard(leaf);
                                cleanup(&fresh, self);
                                return Err(e);
                            }
                        }
                    }
                    Err(e) => {
                        cleanup(&fresh, self);
                        return Err(e);
                    }
                }
            } else {
                match skip_leaf::<V>(self.heap.as_ref(), &[], true) {
                    Ok(p) => p,
                    Err(e) => {
                        cleanup(&fresh, self);
                        return Err(e);
                    }
                }
            };
            fresh.push((b, child));
        }

        if let Some(d) = deeper {
            if !old_bytes.contains(&d[0]) {
                match skip_leaf::<V>(self.heap.as_ref(), &d[1..], true) {
                    Ok(leaf) => {
                        new_leaf = leaf;
                        fresh.push((d[0], leaf));
                    }
                    Err(e) => {
                        cleanup(&fresh, self);
                        return Err(e);
                    }
                }
            }
        }

        fresh.sort_unstable_by_key(|e| e.0);
        let entries: Vec<(u8, u64)> = fresh.iter().map(|&(b, p)| (b, p as u64)).collect();
        let eos = deeper.is_none();
        let parent =
            match node_with_children::<V>(self.heap.as_ref(), t.skip(), &entries, eos, true) {
                Ok(p) => p,
                Err(e) => {
                    cleanup(&fresh, self);
                    return Err(e);
                }
            };

        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            self.discard(parent);
            return Ok(Attempt::Retry);
        }

        unsafe {
            t.bump_version();
            for &(b, child) in &fresh {
                let node = &*child;
                // Bytes from the old terminal set carry their value over
                // (as the chain interior's EOS when the new key runs
                // through them); a fresh branch byte has nothing to move.
                if old_bytes.contains(&b) {
                    node.eos.init(t.cell_for(b).unwrap().take());
                }
                node.clear_poison();
            }
            if !new_leaf.is_null() {
                (*new_leaf).eos.init(slab);
                (*new_leaf).clear_poison();
            } else {
                debug_assert!(eos);
                (*parent).eos.init(slab);
            }
            (*parent).clear_poison();
            self.swing_slot(path, parent as u64, &[path.last().unwrap().node]);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Inserted)
    }

    // One more terminal byte than the leaf's shape can carry: rebuild in
    // the next shape up.
    fn insert_grow_leaf(
        &self,
        path: &[Step<V>],
        c: u8,
        slab: u64,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<Attempt<V>> {
        let t = unsafe { &*path.last().unwrap().node };
        let mut bytes = t.bytes();
        let pos = bytes.binary_search(&c).unwrap_err();
        bytes.insert(pos, c);

        let fresh = leaf_with_bytes::<V>(self.heap.as_ref(), t.skip(), &bytes, true)?;

        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            self.discard(fresh);
            return Ok(Attempt::Retry);
        }

        unsafe {
            t.bump_version();
            let f = &*fresh;
            t.each_cell(|b, cell| f.cell_for(b).unwrap().init(cell.take()));
            f.cell_for(c).unwrap().init(slab);
            f.clear_poison();
            self.swing_slot(path, fresh as u64, &[path.last().unwrap().node]);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Inserted)
    }

    // Interior at shape capacity gains a child: rebuild in the next shape
    // up with the new skip-leaf child folded in.
    fn insert_grow_node(
        &self,
        path: &[Step<V>],
        tail: &[u8],
        slab: u64,
        held: Option<std::sync::MutexGuard<'_, ()>>,
    ) -> Result<Attempt<V>> {
        let t = unsafe { &*path.last().unwrap().node };
        let c = tail[0];

        let leaf = skip_leaf::<V>(self.heap.as_ref(), &tail[1..], true)?;

        let mut entries: Vec<(u8, u64)> = Vec::with_capacity(t.fanout() + 1);
        t.each_child_word(|b, w| entries.push((b, w & !crate::slot::SLOT_TAGS)));
        let pos = entries.binary_search_by_key(&c, |e| e.0).unwrap_err();
        entries.insert(pos, (c, leaf as u64));

        let fresh = match node_with_children::<V>(
            self.heap.as_ref(),
            t.skip(),
            &entries,
            t.has_eos(),
            true,
        ) {
            Ok(p) => p,
            Err(e) => {
                self.discard(leaf);
                return Err(e);
            }
        };

        let guard = self.lock_and_validate(path, held);
        if guard.is_none() {
            self.discard(fresh);
            return Ok(Attempt::Retry);
        }

        unsafe {
            t.bump_version();
            let f = &*fresh;
            if t.has_eos() {
                f.eos.init(t.eos.take());
            }
            (*leaf).eos.init(slab);
            (*leaf).clear_poison();
            f.clear_poison();
            self.swing_slot(path, fresh as u64, &[path.last().unwrap().node]);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Inserted)
    }

    //---------------------------------

    /// Move the victim's value payload into its same-shape replacement.
    /// Children were borrowed at build time; only slabs move here.
    pub(crate) unsafe fn move_payload(&self, victim: &Node<V>, fresh: &Node<V>) {
        if victim.is_leaf() {
            match &victim.body {
                Body::SkipLeaf => fresh.eos.init(victim.eos.take()),
                _ => {
                    victim.each_cell(|b, cell| {
                        fresh.cell_for(b).unwrap().init(cell.take());
                    });
                }
            }
        } else if victim.has_eos() {
            fresh.eos.init(victim.eos.take());
        }
    }
}

//-------------------------------------------------------------------------
