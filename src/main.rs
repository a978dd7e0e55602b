use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use threadpool::ThreadPool;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use bytetrie::ConcurrentTrie;

//-------------------------------------------------------------------------

// Mixed churn driver: one writer inserting and erasing, a handful of
// reader threads hammering lookups.

const NR_KEYS: u64 = 100_000;
const NR_READERS: usize = 4;
const READS_PER_THREAD: u64 = 1_000_000;

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let trie: Arc<ConcurrentTrie<u64, u64>> = Arc::new(ConcurrentTrie::new());

    let begin = Instant::now();
    for k in 0..NR_KEYS {
        trie.insert(&k, k * 3)?;
    }
    info!(
        keys = NR_KEYS,
        elapsed_ms = begin.elapsed().as_millis() as u64,
        "load phase done"
    );

    let pool = ThreadPool::new(NR_READERS + 1);

    for t in 0..NR_READERS {
        let trie = trie.clone();
        pool.execute(move || {
            let mut hits = 0u64;
            let mut x = 0x9e3779b97f4a7c15u64.wrapping_mul(t as u64 + 1);
            for _ in 0..READS_PER_THREAD {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                let k = x % NR_KEYS;
                if let Some(e) = trie.find(&k) {
                    assert_eq!(*e.value(), k * 3);
                    hits += 1;
                }
            }
            info!(thread = t, hits, "reader done");
        });
    }

    {
        let trie = trie.clone();
        pool.execute(move || {
            // Churn a disjoint key range so the readers only ever see
            // stable keys.
            for round in 0..10u64 {
                for k in NR_KEYS..NR_KEYS + 10_000 {
                    trie.insert(&k, round).unwrap();
                }
                for k in NR_KEYS..NR_KEYS + 10_000 {
                    trie.erase(&k).unwrap();
                }
            }
            info!("writer done");
        });
    }

    let begin = Instant::now();
    pool.join();
    let secs = begin.elapsed().as_secs_f64();
    let total_reads = NR_READERS as u64 * READS_PER_THREAD;
    info!(
        total_reads,
        reads_per_sec = (total_reads as f64 / secs) as u64,
        size = trie.size(),
        "churn phase done"
    );

    Ok(())
}

//-------------------------------------------------------------------------
