//! 通过公开接口验证缓冲层在多线程下的行为

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use xv6_bcache::consts::fs::{BSIZE, NBUCKET, NBUF};
use xv6_bcache::{Bcache, BcacheStats, RamDisk};

#[test]
fn default_geometry() {
    let c = Bcache::with_defaults(RamDisk::new(1, 8));
    assert_eq!((c.nbuf(), c.nbucket()), (NBUF, NBUCKET));
    assert_eq!(c.bread(0, 7).data().len(), BSIZE);
}

#[test]
fn lru_over_pool_plus_one() {
    const N: u32 = 5;
    let c = Bcache::new(RamDisk::new(1, 32), N as usize, 3);
    for b in 0..N {
        c.bread(0, b).brelse();
    }
    assert_eq!(c.stats(), BcacheStats { hits: 0, misses: N as u64, evictions: 0 });

    c.bread(0, N).brelse();
    assert_eq!(c.stats().evictions, 1);
    assert!(!c.probe(0, 0));
    assert!((1..=N).all(|b| c.probe(0, b)));
}

#[test]
fn working_set_within_pool_never_evicts() {
    let c = Bcache::new(RamDisk::new(2, 32), 8, 3);
    for round in 0..20u32 {
        for b in 0..4 {
            let dev = round % 2;
            let mut buf = c.bread(dev, b);
            buf.data_mut()[0] = round as u8;
            buf.bwrite();
        }
    }
    let stats = c.stats();
    assert_eq!((stats.misses, stats.evictions), (8, 0));
    assert_eq!(c.disk().reads(), 8);
    assert_eq!(c.disk().writes(), 80);
}

#[test]
fn shared_pool_across_threads() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 250;

    let c = Arc::new(Bcache::new(RamDisk::new(1, 16), 5, 2));
    let start = Arc::new(Barrier::new(THREADS));
    let writes = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let (c, start, writes) = (Arc::clone(&c), Arc::clone(&start), Arc::clone(&writes));
            thread::spawn(move || {
                start.wait();
                for i in 0..ROUNDS {
                    let blockno = ((i * 7 + t) % 12) as u32;
                    let mut b = c.bread(0, blockno);
                    b.data_mut()[1] = b.data()[1].wrapping_add(1);
                    b.bwrite();
                    writes.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let total: usize = (0..12).map(|b| c.disk().peek(0, b)[1] as usize).sum();
    assert_eq!(writes.load(Ordering::Relaxed), THREADS * ROUNDS);
    assert_eq!(total % 256, (THREADS * ROUNDS) % 256);
    assert_eq!(c.disk().writes(), THREADS * ROUNDS);
}

#[test]
#[should_panic(expected = "bget: no buffers")]
fn exhaustion_halts() {
    let c = Bcache::new(RamDisk::new(1, 8), 2, 2);
    let a = c.bread(0, 0);
    a.pin();
    let _b = c.bread(0, 1);
    drop(a);
    c.bread(0, 2);
}
