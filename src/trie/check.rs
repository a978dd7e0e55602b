use anyhow::{ensure, Result};
use std::sync::atomic::Ordering;

use crate::slot::{retry_sentinel, SLOT_TAGS};
use crate::trie::node::*;
use crate::trie::Core;

//-------------------------------------------------------------------------

impl<V: Clone> Core<V> {
    fn check_node(&self, word: u64, seen: &mut std::collections::BTreeSet<u64>) -> Result<u64> {
        ensure!(word != 0, "null child slot");
        ensure!(word != retry_sentinel(), "sentinel left in a slot");
        ensure!(word & SLOT_TAGS == 0, "tag bits left in a slot");
        ensure!(seen.insert(word), "node reachable by two paths");

        let node = unsafe { &*((word & !SLOT_TAGS) as *const Node<V>) };
        ensure!(!node.is_poisoned(), "poisoned node in the live tree");

        let f = node.fanout();
        let mut total = 0;

        if node.is_leaf() {
            match &node.body {
                Body::SkipLeaf => {
                    ensure!(node.eos.is_present(), "skip leaf without a value");
                    total += 1;
                }
                _ => {
                    ensure!(f >= 2, "multi leaf below minimum fan-out");
                    ensure!(
                        Shape::for_fanout(f) == node.shape(),
                        "leaf shape {:?} not minimal for fan-out {}",
                        node.shape(),
                        f
                    );
                    ensure!(!node.has_eos(), "non-skip leaf carrying an EOS");
                    let mut missing = 0;
                    node.each_cell(|_, cell| {
                        if !cell.is_present() {
                            missing += 1;
                        }
                    });
                    ensure!(missing == 0, "{} empty cells in a leaf", missing);
                    total += f as u64;
                }
            }
        } else {
            ensure!(
                Shape::for_fanout(f) == node.shape(),
                "interior shape {:?} not minimal for fan-out {}",
                node.shape(),
                f
            );
            // An interior with a single child and nothing terminating
            // here collapses by definition.
            ensure!(f >= 2 || node.has_eos(), "single-child interior without EOS");

            if node.has_eos() {
                ensure!(node.eos.is_present(), "EOS flag set on an empty cell");
                total += 1;
            }

            let mut children = Vec::with_capacity(f);
            node.each_child_word(|_, w| children.push(w));
            for w in children {
                total += self.check_node(w, seen)?;
            }
        }

        Ok(total)
    }

    /// Checks the tree is well formed and returns the number of live
    /// pairs.
    pub(crate) fn check(&self) -> Result<u64> {
        let w = self.root.load();
        let total = if w == 0 {
            0
        } else {
            let mut seen = std::collections::BTreeSet::new();
            self.check_node(w, &mut seen)?
        };

        let counted = self.count.load(Ordering::Relaxed) as u64;
        ensure!(
            total == counted,
            "live pairs {} != maintained count {}",
            total,
            counted
        );
        Ok(total)
    }
}

//-------------------------------------------------------------------------
