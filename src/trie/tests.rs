//-------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use anyhow::{ensure, Result};
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use test_log::test;
    use threadpool::ThreadPool;

    use crate::slot::SLOT_TAGS;
    use crate::trie::node::{Node, Shape};
    use crate::trie::{ConcurrentTrie, Trie};

    //---------------------------------

    fn k(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    struct Fixture {
        trie: Trie<Vec<u8>, u64>,
    }

    impl Fixture {
        fn new() -> Self {
            Self { trie: Trie::new() }
        }

        fn insert(&mut self, key: &str, v: u64) -> bool {
            let (_, inserted) = self.trie.insert(&k(key), v).unwrap();
            inserted
        }

        fn erase(&mut self, key: &str) -> bool {
            self.trie.erase(&k(key)).unwrap()
        }

        fn find(&self, key: &str) -> Option<u64> {
            self.trie.find(&k(key)).map(|e| *e.value())
        }

        fn contains(&self, key: &str) -> bool {
            self.trie.contains(&k(key))
        }

        fn check(&self) -> Result<u64> {
            self.trie.check()
        }

        fn root(&self) -> &Node<u64> {
            let w = self.trie.core.root.load();
            assert!(w != 0, "empty root");
            unsafe { &*((w & !SLOT_TAGS) as *const Node<u64>) }
        }
    }

    fn collect_skips(node: &Node<u64>, out: &mut Vec<Vec<u8>>) {
        out.push(node.skip().to_vec());
        let mut kids = Vec::new();
        node.each_child_word(|_, w| kids.push(w));
        for w in kids {
            let child = unsafe { &*((w & !SLOT_TAGS) as *const Node<u64>) };
            collect_skips(child, out);
        }
    }

    //---------------------------------

    #[test]
    fn empty_trie() -> Result<()> {
        let fix = Fixture::new();
        ensure!(fix.trie.is_empty());
        ensure!(fix.trie.size() == 0);
        ensure!(!fix.contains("anything"));
        ensure!(fix.find("anything").is_none());
        ensure!(fix.trie.begin().is_none());
        ensure!(fix.check()? == 0);
        Ok(())
    }

    #[test]
    fn insert_single() -> Result<()> {
        let mut fix = Fixture::new();
        ensure!(fix.insert("hello", 100));
        ensure!(fix.contains("hello"));
        ensure!(fix.find("hello") == Some(100));
        ensure!(fix.find("hell").is_none());
        ensure!(fix.find("hello!").is_none());
        ensure!(fix.trie.size() == 1);
        ensure!(fix.check()? == 1);
        Ok(())
    }

    #[test]
    fn insert_existing_keeps_first_value() -> Result<()> {
        // Second insert reports not-inserted and must not overwrite.
        let mut fix = Fixture::new();
        ensure!(fix.insert("key", 1));
        let (entry, inserted) = fix.trie.insert(&k("key"), 2).unwrap();
        ensure!(!inserted);
        ensure!(*entry.value() == 1);
        ensure!(fix.find("key") == Some(1));
        ensure!(fix.trie.size() == 1);
        fix.check()?;
        Ok(())
    }

    #[test]
    fn erase_twice() -> Result<()> {
        let mut fix = Fixture::new();
        fix.insert("key", 1);
        ensure!(fix.erase("key"));
        ensure!(!fix.erase("key"));
        ensure!(fix.trie.is_empty());
        ensure!(fix.check()? == 0);
        Ok(())
    }

    #[test]
    fn clear_resets_everything() -> Result<()> {
        let mut fix = Fixture::new();
        for i in 0..100 {
            fix.insert(&format!("key{}", i), i);
        }
        fix.trie.clear();
        ensure!(fix.trie.size() == 0);
        ensure!(fix.find("key1").is_none());
        ensure!(fix.trie.begin().is_none());
        ensure!(fix.check()? == 0);
        Ok(())
    }

    #[test]
    fn empty_key_roundtrips() -> Result<()> {
        let mut fix = Fixture::new();
        ensure!(fix.insert("", 42));
        ensure!(fix.find("") == Some(42));
        ensure!(fix.trie.size() == 1);

        let begin = fix.trie.begin().unwrap();
        ensure!(begin.key_bytes().is_empty());
        ensure!(*begin.value() == 42);

        ensure!(fix.erase(""));
        ensure!(!fix.contains(""));
        ensure!(fix.check()? == 0);
        Ok(())
    }

    #[test]
    fn empty_key_alongside_others() -> Result<()> {
        let mut fix = Fixture::new();
        fix.insert("", 1);
        fix.insert("a", 2);
        ensure!(fix.find("") == Some(1));
        ensure!(fix.find("a") == Some(2));
        fix.check()?;

        ensure!(fix.erase(""));
        ensure!(fix.find("a") == Some(2));
        let root = fix.root();
        ensure!(root.is_leaf());
        ensure!(root.skip() == b"a");
        fix.check()?;
        Ok(())
    }

    //---------------------------------

    #[test]
    fn scenario_prefix_family() -> Result<()> {
        let mut fix = Fixture::new();
        fix.insert("a", 1);
        fix.insert("ab", 2);
        fix.insert("ac", 3);
        ensure!(fix.trie.size() == 3);
        fix.check()?;

        ensure!(fix.erase("ab"));
        ensure!(fix.find("a") == Some(1));
        ensure!(fix.find("ac") == Some(3));
        ensure!(!fix.contains("ab"));
        ensure!(fix.trie.size() == 2);

        // One interior left: skip "a", EOS = 1, single child on 'c'
        // leading to a leaf holding 3.
        let root = fix.root();
        ensure!(!root.is_leaf());
        ensure!(root.skip() == b"a");
        ensure!(root.has_eos());
        ensure!(root.fanout() == 1);
        ensure!(root.bytes() == vec![b'c']);

        let child_w = root.child_word(b'c').unwrap();
        let child = unsafe { &*((child_w & !SLOT_TAGS) as *const Node<u64>) };
        ensure!(child.is_leaf());
        ensure!(child.skip().is_empty());

        fix.check()?;
        Ok(())
    }

    #[test]
    fn scenario_one_byte_keys_shape_ladder() -> Result<()> {
        let mut fix = Fixture::new();

        for b in 0u8..7 {
            let (_, inserted) = fix.trie.insert(&vec![b], b as u64).unwrap();
            ensure!(inserted);
        }

        let root = fix.root();
        ensure!(root.is_leaf());
        ensure!(root.shape() == Shape::List);
        ensure!(root.fanout() == 7);
        fix.check()?;

        // One more distinct next-byte tips it into POP.
        fix.trie.insert(&vec![7u8], 7).unwrap();
        let root = fix.root();
        ensure!(root.is_leaf());
        ensure!(root.shape() == Shape::Pop);
        ensure!(root.fanout() == 8);

        for b in 0u8..8 {
            ensure!(fix.trie.find(&vec![b]).map(|e| *e.value()) == Some(b as u64));
        }
        fix.check()?;
        Ok(())
    }

    #[test]
    fn all_256_last_bytes_make_a_full_leaf() -> Result<()> {
        let mut fix = Fixture::new();
        for b in 0u8..=255 {
            let key = vec![b'p', b'p', b];
            fix.trie.insert(&key, b as u64).unwrap();
        }

        let root = fix.root();
        ensure!(root.is_leaf());
        ensure!(root.shape() == Shape::Full);
        ensure!(root.fanout() == 256);
        ensure!(root.skip() == b"pp");

        for b in 0u8..=255 {
            let key = vec![b'p', b'p', b];
            ensure!(fix.trie.find(&key).map(|e| *e.value()) == Some(b as u64));
        }
        ensure!(fix.check()? == 256);
        Ok(())
    }

    #[test]
    fn pop_to_full_transition() -> Result<()> {
        let mut fix = Fixture::new();
        for b in 0u8..32 {
            fix.trie.insert(&vec![b'x', b], b as u64).unwrap();
        }
        ensure!(fix.root().shape() == Shape::Pop);

        fix.trie.insert(&vec![b'x', 32], 32).unwrap();
        ensure!(fix.root().shape() == Shape::Full);
        ensure!(fix.check()? == 33);
        Ok(())
    }

    #[test]
    fn shape_shrink_ladder() -> Result<()> {
        let mut fix = Fixture::new();
        for b in 0u8..33 {
            fix.trie.insert(&vec![b'x', b], b as u64).unwrap();
        }
        ensure!(fix.root().shape() == Shape::Full);

        // 33 -> 32 entries: FULL -> POP
        fix.trie.erase(&vec![b'x', 32]).unwrap();
        ensure!(fix.root().shape() == Shape::Pop);
        fix.check()?;

        // down to 7: POP -> LIST
        for b in 7u8..32 {
            fix.trie.erase(&vec![b'x', b]).unwrap();
        }
        ensure!(fix.root().shape() == Shape::List);
        fix.check()?;

        // down to 2: LIST -> BINARY
        for b in 2u8..7 {
            fix.trie.erase(&vec![b'x', b]).unwrap();
        }
        ensure!(fix.root().shape() == Shape::Binary);
        fix.check()?;

        // down to 1: the survivor folds into the skip.
        fix.trie.erase(&vec![b'x', 1]).unwrap();
        let root = fix.root();
        ensure!(root.is_leaf());
        ensure!(root.shape() == Shape::Skip);
        ensure!(root.skip() == &[b'x', 0][..]);
        ensure!(fix.trie.find(&vec![b'x', 0]).map(|e| *e.value()) == Some(0));
        ensure!(fix.check()? == 1);
        Ok(())
    }

    #[test]
    fn classic_split_keys() -> Result<()> {
        let mut fix = Fixture::new();
        fix.insert("romane", 1);
        fix.insert("romanus", 2);
        fix.insert("romulus", 3);
        fix.insert("rubens", 4);
        fix.insert("ruber", 5);
        fix.insert("rubicon", 6);
        fix.insert("rubicundus", 7);
        ensure!(fix.trie.size() == 7);
        fix.check()?;

        ensure!(fix.find("romane") == Some(1));
        ensure!(fix.find("romanus") == Some(2));
        ensure!(fix.find("romulus") == Some(3));
        ensure!(fix.find("rubens") == Some(4));
        ensure!(fix.find("ruber") == Some(5));
        ensure!(fix.find("rubicon") == Some(6));
        ensure!(fix.find("rubicundus") == Some(7));
        ensure!(fix.find("rom").is_none());
        ensure!(fix.find("romanes").is_none());

        ensure!(fix.erase("romanus"));
        ensure!(fix.find("romane") == Some(1));
        ensure!(fix.find("romulus") == Some(3));
        fix.check()?;

        ensure!(fix.erase("rubicon"));
        ensure!(fix.erase("rubicundus"));
        ensure!(fix.find("rubens") == Some(4));
        ensure!(fix.find("ruber") == Some(5));
        ensure!(fix.check()? == 4);
        Ok(())
    }

    #[test]
    fn deepen_and_collapse() -> Result<()> {
        let mut fix = Fixture::new();

        // Single-byte siblings pack into a leaf, then a deeper key forces
        // the leaf into interior form.
        fix.insert("a", 1);
        fix.insert("b", 2);
        fix.insert("c", 3);
        ensure!(fix.root().is_leaf());
        fix.check()?;

        fix.insert("cx", 4);
        let root = fix.root();
        ensure!(!root.is_leaf());
        fix.check()?;

        ensure!(fix.find("a") == Some(1));
        ensure!(fix.find("b") == Some(2));
        ensure!(fix.find("c") == Some(3));
        ensure!(fix.find("cx") == Some(4));

        // And back out again.
        ensure!(fix.erase("cx"));
        fix.check()?;
        ensure!(fix.find("c") == Some(3));
        ensure!(fix.erase("c"));
        ensure!(fix.erase("b"));
        fix.check()?;
        ensure!(fix.find("a") == Some(1));
        let root = fix.root();
        ensure!(root.is_leaf());
        ensure!(fix.check()? == 1);
        Ok(())
    }

    #[test]
    fn eos_insert_and_erase_on_interior() -> Result<()> {
        let mut fix = Fixture::new();
        fix.insert("ab", 1);
        fix.insert("ac", 2);
        fix.check()?;

        // "a" terminates exactly at the interior above b/c.
        fix.insert("a", 3);
        ensure!(fix.find("a") == Some(3));
        fix.check()?;

        ensure!(fix.erase("a"));
        ensure!(!fix.contains("a"));
        ensure!(fix.find("ab") == Some(1));
        ensure!(fix.find("ac") == Some(2));
        fix.check()?;
        Ok(())
    }

    #[test]
    fn sibling_fuse_after_erase() -> Result<()> {
        let mut fix = Fixture::new();
        fix.insert("abd", 1);
        fix.insert("acd", 2);
        fix.check()?;

        ensure!(fix.erase("abd"));
        // Interior lost one of two children with no EOS: the survivor
        // fuses, and the whole key collapses back into one skip.
        let root = fix.root();
        ensure!(root.is_leaf());
        ensure!(root.skip() == b"acd");
        ensure!(fix.find("acd") == Some(2));
        ensure!(fix.check()? == 1);
        Ok(())
    }

    #[test]
    fn eos_fuse_after_erase() -> Result<()> {
        let mut fix = Fixture::new();
        fix.insert("a", 1);
        fix.insert("ab", 2);
        fix.check()?;

        ensure!(fix.erase("a"));
        let root = fix.root();
        ensure!(root.is_leaf());
        ensure!(root.skip() == b"ab");
        ensure!(fix.find("ab") == Some(2));
        ensure!(fix.check()? == 1);
        Ok(())
    }

    #[test]
    fn prefix_chain_shares_one_skip() -> Result<()> {
        let mut fix = Fixture::new();
        for i in 0..1000 {
            let key = format!("prefix/{:03}", i);
            fix.trie.insert(&k(&key), i as u64).unwrap();
        }
        ensure!(fix.check()? == 1000);

        for i in 0..1000 {
            let key = format!("prefix/{:03}", i);
            ensure!(fix.trie.find(&k(&key)).map(|e| *e.value()) == Some(i as u64));
        }

        // The shared prefix is compressed into exactly one node's skip.
        let mut skips = Vec::new();
        collect_skips(fix.root(), &mut skips);
        let with_prefix = skips
            .iter()
            .filter(|s| {
                s.windows(b"prefix/".len())
                    .any(|w| w == b"prefix/")
            })
            .count();
        ensure!(with_prefix == 1, "prefix appears in {} skips", with_prefix);
        Ok(())
    }

    #[test]
    fn begin_returns_leftmost() -> Result<()> {
        let mut fix = Fixture::new();
        fix.insert("m", 1);
        fix.insert("z", 2);
        fix.insert("aa", 3);
        fix.insert("ab", 4);

        let begin = fix.trie.begin().unwrap();
        ensure!(begin.key_bytes() == b"aa");
        ensure!(*begin.value() == 3);

        // A shorter key on the same path sorts first.
        fix.insert("a", 5);
        let begin = fix.trie.begin().unwrap();
        ensure!(begin.key_bytes() == b"a");
        ensure!(*begin.value() == 5);
        Ok(())
    }

    #[test]
    fn entry_next_is_end() {
        let mut fix = Fixture::new();
        fix.insert("a", 1);
        let e = fix.trie.begin().unwrap();
        assert!(e.next().is_none());
    }

    #[test]
    fn swap_exchanges_contents() -> Result<()> {
        let mut a = Fixture::new();
        let mut b = Fixture::new();
        a.insert("left", 1);
        b.insert("right", 2);
        b.insert("right2", 3);

        a.trie.swap(&mut b.trie);
        ensure!(a.trie.size() == 2);
        ensure!(b.trie.size() == 1);
        ensure!(a.find("right") == Some(2));
        ensure!(b.find("left") == Some(1));
        ensure!(!a.contains("left"));
        a.check()?;
        b.check()?;
        Ok(())
    }

    #[test]
    fn clone_then_diverge() -> Result<()> {
        let mut fix = Fixture::new();
        for i in 0..50 {
            fix.insert(&format!("key/{:02}", i), i);
        }

        let mut copy = Fixture {
            trie: fix.trie.clone(),
        };
        ensure!(copy.trie.size() == 50);
        copy.check()?;

        // Divergent edits leave the two independent.
        ensure!(copy.erase("key/00"));
        copy.insert("only-in-copy", 99);
        fix.insert("only-in-orig", 98);

        ensure!(fix.find("key/00") == Some(0));
        ensure!(!copy.contains("key/00"));
        ensure!(copy.find("only-in-copy") == Some(99));
        ensure!(!fix.contains("only-in-copy"));
        ensure!(!copy.contains("only-in-orig"));
        fix.check()?;
        copy.check()?;
        Ok(())
    }

    #[test]
    fn u64_keys_sequential() -> Result<()> {
        let mut trie: Trie<u64, u64> = Trie::new();
        for i in 0..2000u64 {
            trie.insert(&i, i * 3).unwrap();
        }
        ensure!(trie.size() == 2000);
        trie.check()?;

        for i in (0..2000u64).step_by(2) {
            ensure!(trie.erase(&i).unwrap());
        }
        ensure!(trie.size() == 1000);
        trie.check()?;

        for i in 0..2000u64 {
            let want = if i % 2 == 1 { Some(i * 3) } else { None };
            ensure!(trie.find(&i).map(|e| *e.value()) == want);
        }

        let begin = trie.begin().unwrap();
        ensure!(begin.key() == 1u64);
        Ok(())
    }

    //---------------------------------

    // Random workload against a reference map, dense prefixes.
    #[test]
    fn random_against_reference() -> Result<()> {
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
        let mut fix = Fixture::new();
        let mut reference: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        // Short keys over a tiny alphabet force heavy prefix sharing and
        // every structural transition.
        let mut candidates: Vec<Vec<u8>> = Vec::new();
        let alphabet = b"abc";
        for len in 0..=5usize {
            let mut keys = vec![Vec::new()];
            for _ in 0..len {
                let mut next = Vec::new();
                for key in keys {
                    for &c in alphabet {
                        let mut nk = key.clone();
                        nk.push(c);
                        next.push(nk);
                    }
                }
                keys = next;
            }
            candidates.extend(keys);
        }

        for op in 0..20_000 {
            let key = candidates[rng.gen_range(0..candidates.len())].clone();
            if rng.gen_bool(0.6) {
                let v = rng.gen::<u64>();
                let (entry, inserted) = fix.trie.insert(&key, v).unwrap();
                match reference.get(&key) {
                    // Insert of an existing key must keep the first value.
                    Some(&existing) => {
                        ensure!(!inserted);
                        ensure!(*entry.value() == existing);
                    }
                    None => {
                        ensure!(inserted);
                        reference.insert(key.clone(), v);
                    }
                }
            } else {
                let erased = fix.trie.erase(&key).unwrap();
                ensure!(erased == reference.remove(&key).is_some());
            }

            if op % 2000 == 1999 {
                ensure!(fix.check()? == reference.len() as u64);
            }
        }

        ensure!(fix.trie.size() == reference.len());
        for key in &candidates {
            ensure!(
                fix.trie.find(key).map(|e| *e.value()) == reference.get(key).copied(),
                "mismatch on {:?}",
                key
            );
        }
        fix.check()?;
        Ok(())
    }

    // Random workload, sparse binary keys.
    #[test]
    fn random_binary_keys() -> Result<()> {
        let mut rng = ChaCha8Rng::seed_from_u64(0xbeef);
        let mut fix = Fixture::new();
        let mut reference: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for op in 0..10_000 {
            let len = rng.gen_range(0..=4usize);
            let key: Vec<u8> = (0..len).map(|_| rng.gen::<u8>()).collect();
            if rng.gen_bool(0.7) {
                let v = rng.gen::<u64>();
                let (entry, inserted) = fix.trie.insert(&key, v).unwrap();
                match reference.get(&key) {
                    Some(&existing) => {
                        ensure!(!inserted);
                        ensure!(*entry.value() == existing);
                    }
                    None => {
                        ensure!(inserted);
                        reference.insert(key, v);
                    }
                }
            } else {
                ensure!(fix.trie.erase(&key).unwrap() == reference.remove(&key).is_some());
            }

            if op % 2500 == 2499 {
                ensure!(fix.check()? == reference.len() as u64);
            }
        }

        for (key, v) in &reference {
            ensure!(fix.trie.find(key).map(|e| *e.value()) == Some(*v));
        }
        fix.check()?;
        Ok(())
    }

    #[test]
    fn insert_all_erase_all_random_order() -> Result<()> {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut fix = Fixture::new();

        let mut keys: Vec<String> = (0..500).map(|i| format!("node/{:03}", i)).collect();
        keys.shuffle(&mut rng);
        for (i, key) in keys.iter().enumerate() {
            fix.insert(key, i as u64);
        }
        ensure!(fix.check()? == 500);

        keys.shuffle(&mut rng);
        for key in &keys {
            ensure!(fix.erase(key));
        }
        ensure!(fix.trie.size() == 0);
        ensure!(fix.trie.core.root.load() == 0);
        ensure!(fix.check()? == 0);
        Ok(())
    }

    //---------------------------------
    // threaded mode

    #[test]
    fn concurrent_readers_during_load() {
        let trie: Arc<ConcurrentTrie<u64, u64>> = Arc::new(ConcurrentTrie::new());

        const STABLE: u64 = 20_000;
        for i in 0..STABLE {
            trie.insert(&i, i * 7).unwrap();
        }

        let pool = ThreadPool::new(4);
        let stop = Arc::new(AtomicBool::new(false));

        // Writer keeps loading a disjoint range.
        {
            let trie = trie.clone();
            let stop = stop.clone();
            pool.execute(move || {
                let mut i = STABLE;
                while !stop.load(Ordering::Relaxed) {
                    trie.insert(&i, i * 7).unwrap();
                    i += 1;
                }
            });
        }

        for t in 0..3 {
            let trie = trie.clone();
            pool.execute(move || {
                let mut x = 0xdeadbeefu64.wrapping_add(t);
                for _ in 0..200_000 {
                    x ^= x << 13;
                    x ^= x >> 7;
                    x ^= x << 17;
                    let key = x % STABLE;
                    // A stable key must never be missed, and a found
                    // value must be the one that was inserted.
                    let e = trie.find(&key).expect("stable key went missing");
                    assert_eq!(*e.value(), key * 7);
                }
            });
        }

        std::thread::sleep(std::time::Duration::from_millis(100));
        stop.store(true, Ordering::Relaxed);
        pool.join();

        trie.check().unwrap();
        for i in 0..STABLE {
            assert_eq!(trie.find(&i).map(|e| *e.value()), Some(i * 7));
        }
    }

    #[test]
    fn concurrent_stable_key_under_churn() {
        let trie: Arc<ConcurrentTrie<Vec<u8>, u64>> = Arc::new(ConcurrentTrie::new());
        trie.insert(&k("stable-key"), 7).unwrap();

        let pool = ThreadPool::new(4);
        let stop = Arc::new(AtomicBool::new(false));

        // Continuous churn on a disjoint key set, including erases, so
        // the stable key's ancestors get rebuilt under the readers.
        {
            let trie = trie.clone();
            let stop = stop.clone();
            pool.execute(move || {
                let mut round = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    for i in 0..200u64 {
                        let key = k(&format!("stab{}", i * 131 + round));
                        trie.insert(&key, i).unwrap();
                    }
                    for i in 0..200u64 {
                        let key = k(&format!("stab{}", i * 131 + round));
                        trie.erase(&key).unwrap();
                    }
                    round += 1;
                }
            });
        }

        for _ in 0..3 {
            let trie = trie.clone();
            pool.execute(move || {
                let key = k("stable-key");
                for _ in 0..100_000 {
                    let e = trie.find(&key).expect("stable key went missing");
                    assert_eq!(*e.value(), 7);
                }
            });
        }

        std::thread::sleep(std::time::Duration::from_millis(100));
        stop.store(true, Ordering::Relaxed);
        pool.join();

        assert_eq!(trie.find(&k("stable-key")).map(|e| *e.value()), Some(7));
        trie.check().unwrap();
    }

    #[test]
    fn concurrent_erase_reinsert_cycle() {
        let trie: Arc<ConcurrentTrie<u64, u64>> = Arc::new(ConcurrentTrie::new());
        for i in 0..1000u64 {
            trie.insert(&i, i).unwrap();
        }

        let pool = ThreadPool::new(3);

        // Writer erases and reinserts the upper half; readers assert the
        // lower half never flickers.
        {
            let trie = trie.clone();
            pool.execute(move || {
                for _ in 0..50 {
                    for i in 500..1000u64 {
                        trie.erase(&i).unwrap();
                    }
                    for i in 500..1000u64 {
                        trie.insert(&i, i).unwrap();
                    }
                }
            });
        }

        for _ in 0..2 {
            let trie = trie.clone();
            pool.execute(move || {
                let mut x = 12345u64;
                for _ in 0..100_000 {
                    x ^= x << 13;
                    x ^= x >> 7;
                    x ^= x << 17;
                    let key = x % 500;
                    let e = trie.find(&key).expect("lower-half key went missing");
                    assert_eq!(*e.value(), key);
                }
            });
        }

        pool.join();
        assert_eq!(trie.size(), 1000);
        trie.check().unwrap();
    }
}

//-------------------------------------------------------------------------
