//! 缓存层
//!
//! 缓冲池由固定数量的缓冲块组成，按块号散列到若干个桶中。
//! 命中时只需要锁住一个桶；未命中时先拿全局替换锁，再按下标递增的顺序
//! 拿下全部桶锁，重新确认未命中后按最近最少使用策略挑选替换对象。
//!
//! 使用方式：
//! * `bread` 取得某个块的缓冲，内容保证与磁盘一致；
//! * 修改数据后调用 `bwrite` 写回磁盘；
//! * 用完后丢弃 `Buf`（或调用 `brelse`），之后不得再使用它；
//! * 同一时刻只有一个执行流能持有某个缓冲块，不要长时间占用。

use core::mem::{self, ManuallyDrop};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::thread;

use crate::consts::fs::{BSIZE, NBUCKET, NBUF};
use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;
use super::bucket::{BucketTable, UNUSED};

bitflags! {
    /// 缓冲块状态位
    pub struct BufFlags: u8 {
        /// 数据已从磁盘读入，与磁盘内容一致
        const VALID = 1 << 0;
        /// 磁盘正在使用该缓冲块的数据
        const DISK = 1 << 1;
    }
}

/// 缓冲区缓存（Buffer Cache），用于块设备的读写缓存。
///
/// `Bcache` 提供了一个固定大小的内存缓冲区池，用于缓存磁盘块数据，
/// 以减少重复的磁盘访问，同时是多个执行流并发访问同一磁盘块的同步点。
///
/// 该结构在内核初始化阶段、并发开始之前构造一次，之后以共享引用的形式
/// 交给各个执行流使用，缓冲块本身从不分配或释放，只会被替换身份。
pub struct Bcache<D: BlockDevice> {
    /// 块设备驱动
    disk: D,

    /// 全局替换锁，串行化所有未命中的处理
    evict: SpinLock<()>,

    /// 哈希桶表，保存每个缓冲块的身份、引用计数与时间戳
    table: BucketTable,

    /// 缓冲块数组，与 `table` 中的控制信息按下标一一对应
    bufs: Box<[BufInner]>,

    /// 逻辑时钟，每次获取或释放缓冲块时前进一步
    clock: AtomicU64,

    stats: Stats,
}

impl<D: BlockDevice> Bcache<D> {
    /// 初始化缓冲区缓存。
    ///
    /// # 功能说明
    /// 创建 `nbuf` 个缓冲块，轮流分配到 `nbucket` 个桶中，
    /// 所有缓冲块的时间戳都初始化为"从未使用"。
    ///
    /// # 可能的错误
    /// - `nbuf` 或 `nbucket` 为 0 时 panic。
    pub fn new(disk: D, nbuf: usize, nbucket: usize) -> Self {
        if nbuf == 0 {
            panic!("binit: empty buffer pool");
        }
        if nbucket == 0 {
            panic!("binit: no buckets");
        }

        let bcache = Self {
            disk,
            evict: SpinLock::new((), "bcache_evict"),
            table: BucketTable::new(nbuf, nbucket),
            bufs: (0..nbuf).map(|_| BufInner::new()).collect(),
            clock: AtomicU64::new(UNUSED),
            stats: Stats::new(),
        };

        log::info!("bcache: {} buffers in {} buckets, {} bytes per block", nbuf, nbucket, BSIZE);
        #[cfg(feature = "verbose_init_info")]
        for b in 0..nbucket {
            let guard = bcache.table.lock(b);
            let n = bcache.table.members(&guard).len();
            drop(guard);
            log::info!("bcache: bucket {} starts with {} buffers", b, n);
        }

        bcache
    }

    /// 使用默认的 `NBUF` 与 `NBUCKET` 初始化。
    pub fn with_defaults(disk: D) -> Self {
        Self::new(disk, NBUF, NBUCKET)
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// 缓冲块数量
    pub fn nbuf(&self) -> usize {
        self.table.nbuf()
    }

    /// 桶数量
    pub fn nbucket(&self) -> usize {
        self.table.nbucket()
    }

    pub fn stats(&self) -> BcacheStats {
        self.stats.snapshot()
    }

    /// 查询 `(dev, blockno)` 当前是否在缓存中，不获取缓冲块，也不改变其时间戳。
    pub fn probe(&self, dev: u32, blockno: u32) -> bool {
        let guard = self.table.lock(self.table.hash(blockno));
        let found = self.table.find(&guard, dev, blockno).is_some();
        drop(guard);
        found
    }

    /// 逻辑时钟前进一步并返回新值，第一个值大于 `UNUSED`。
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 获取指定设备与块号对应的缓冲块。
    ///
    /// # 功能说明
    /// 若缓存命中，则返回已存在的缓冲块；否则回收一个未被引用的缓冲块
    /// 分配给该块。不涉及实际磁盘读写，内容可能尚未有效，
    /// 调用者需要时应调用 `Buf::ensure_valid`。
    ///
    /// # 流程解释
    /// - 锁住 `blockno` 所在的桶并查找；命中则增加引用计数、更新时间戳，
    ///   释放桶锁后再等待缓冲块的数据锁；
    /// - 未命中则释放桶锁，进入 `recycle` 的慢路径。
    ///
    /// 引用计数总是在等待数据锁之前增加，替换路径因此不会选中它。
    ///
    /// # 可能的错误
    /// - 所有缓冲块都在使用中时 panic（`"bget: no buffers"`）。
    pub fn bget(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let bucket = self.table.hash(blockno);
        let mut guard = self.table.lock(bucket);

        if let Some(index) = self.table.find(&guard, dev, blockno) {
            let ticks = self.tick();
            let c = self.table.ctrl_mut(&mut guard, index);
            c.refcnt += 1;
            c.ticks = ticks;
            drop(guard);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            log::trace!("bcache: hit ({}, {}) in buf {}", dev, blockno, index);
            return self.hold(index, dev, blockno, bucket);
        }

        drop(guard);
        self.recycle(bucket, dev, blockno)
    }

    /// # 功能说明
    /// 未命中的慢路径：在全局替换锁与全部桶锁的保护下复查，
    /// 仍未命中则挑选替换对象并把它移到目标桶中。
    ///
    /// # 流程解释
    /// 1. 获取全局替换锁，再按下标递增获取全部桶锁；
    /// 2. 复查目标桶：释放桶锁到拿到替换锁之间，别的执行流可能已经装入了同一个块；
    /// 3. 挑选替换对象，若它仍被引用则缓冲池耗尽；
    /// 4. 只保留目标桶与替换对象原来所在桶的锁，其余全部释放；
    /// 5. 把替换对象从原桶摘下，改写身份、清除有效位、引用计数置 1、更新时间戳，
    ///    插入目标桶头部；
    /// 6. 释放剩余的桶锁与替换锁，最后等待其数据锁。
    fn recycle(&self, bucket: usize, dev: u32, blockno: u32) -> Buf<'_, D> {
        let evict = self.evict.lock();
        let mut all = self.table.lock_all();

        if let Some(index) = self.table.find(&all[bucket], dev, blockno) {
            let ticks = self.tick();
            let c = self.table.ctrl_mut(&mut all[bucket], index);
            c.refcnt += 1;
            c.ticks = ticks;
            drop(all);
            drop(evict);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("bcache: ({}, {}) cached by another cpu, buf {}", dev, blockno, index);
            return self.hold(index, dev, blockno, bucket);
        }

        let victim = self.table.select_victim(&all);
        let old = self.table.view(&all, victim);
        if old.refcnt != 0 {
            log::error!("bcache: all {} buffers are in use, cannot cache ({}, {})", self.nbuf(), dev, blockno);
            panic!("bget: no buffers");
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        if old.ticks != UNUSED {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            log::debug!("bcache: evict buf {} ({}, {}) for ({}, {})", victim, old.dev, old.blockno, dev, blockno);
        } else {
            log::debug!("bcache: fresh buf {} for ({}, {})", victim, dev, blockno);
        }

        let mut kept: Vec<_> = all
            .into_iter()
            .filter(|g| g.index() == bucket || g.index() == old.bucket)
            .collect();

        let ticks = self.tick();
        match kept.as_mut_slice() {
            [same] => {
                self.table.unlink(same, victim);
                self.table.push_front(same, victim);
                let c = self.table.ctrl_mut(same, victim);
                c.dev = dev;
                c.blockno = blockno;
                c.refcnt = 1;
                c.pins = 0;
                c.ticks = ticks;
            }
            [a, b] => {
                let (from, to) = if a.index() == old.bucket { (a, b) } else { (b, a) };
                self.table.unlink(from, victim);
                self.table.push_front(to, victim);
                let c = self.table.ctrl_mut(to, victim);
                c.dev = dev;
                c.blockno = blockno;
                c.refcnt = 1;
                c.pins = 0;
                c.ticks = ticks;
            }
            _ => unreachable!("bget: bucket locks"),
        }
        self.bufs[victim].clear(BufFlags::VALID);

        drop(kept);
        drop(evict);
        self.hold(victim, dev, blockno, bucket)
    }

    /// 等待缓冲块的数据锁并构造 `Buf`，调用时不得持有任何自旋锁。
    fn hold(&self, index: usize, dev: u32, blockno: u32, bucket: usize) -> Buf<'_, D> {
        let data = self.bufs[index].data.lock();
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            bucket,
            data: ManuallyDrop::new(data),
        }
    }

    /// 从缓冲区缓存中读取指定设备与块号对应的数据。
    ///
    /// 若缓冲块未被标记为有效，会先从磁盘读入一次。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let mut b = self.bget(dev, blockno);
        b.ensure_valid();
        b
    }

    /// 释放一次引用，数据锁已由调用者释放。
    ///
    /// 只更新时间戳，不调整缓冲块在桶内的位置。
    fn brelse(&self, index: usize, bucket: usize) {
        let mut guard = self.table.lock(bucket);
        let ticks = self.tick();
        let c = self.table.ctrl_mut(&mut guard, index);
        if c.refcnt == 0 {
            panic!("brelse: refcnt");
        }
        c.refcnt -= 1;
        c.ticks = ticks;
        drop(guard);
    }

    /// 在持有所属桶锁的情况下钉住或解除钉住，不触碰数据锁。
    ///
    /// 钉住次数单独记录：等待数据锁的执行流同样计入 `refcnt`，
    /// 只看 `refcnt` 无法判断一次 `unpin` 是否有配对的 `pin`。
    fn adjust_ref(&self, index: usize, bucket: usize, pin: bool) {
        let mut guard = self.table.lock(bucket);
        let c = self.table.ctrl_mut(&mut guard, index);
        if pin {
            c.refcnt += 1;
            c.pins += 1;
        } else {
            if c.pins == 0 {
                panic!("bunpin: not pinned");
            }
            c.pins -= 1;
            c.refcnt -= 1;
        }
        drop(guard);
    }

    #[cfg(test)]
    fn audit(&self) -> Vec<(u32, u32)> {
        let evict = self.evict.lock();
        let all = self.table.lock_all();
        let mut seen = std::collections::HashSet::new();
        let mut total = 0;
        for g in all.iter() {
            for i in self.table.members(g) {
                let v = self.table.view(&all, i);
                assert_eq!(v.bucket, g.index(), "buf {} in wrong bucket", i);
                if v.ticks != UNUSED {
                    assert_eq!(self.table.hash(v.blockno), g.index());
                    assert!(seen.insert((v.dev, v.blockno)), "({}, {}) cached twice", v.dev, v.blockno);
                }
                total += 1;
            }
        }
        assert_eq!(total, self.nbuf());
        drop(all);
        drop(evict);
        let mut keys: Vec<_> = seen.into_iter().collect();
        keys.sort_unstable();
        keys
    }

    #[cfg(test)]
    fn refcnt(&self, dev: u32, blockno: u32) -> Option<usize> {
        let mut guard = self.table.lock(self.table.hash(blockno));
        let index = self.table.find(&guard, dev, blockno)?;
        Some(self.table.ctrl_mut(&mut guard, index).refcnt)
    }
}

/// 缓存命中情况统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BcacheStats {
    /// 命中次数，包括慢路径复查时命中
    pub hits: u64,
    /// 需要分配缓冲块的次数
    pub misses: u64,
    /// 未命中时替换掉一个已使用过的缓冲块的次数
    pub evictions: u64,
}

struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> BcacheStats {
        BcacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// 一个被持有的缓冲块。
///
/// `Buf` 代表特定 `(dev, blockno)` 的缓冲块，持有其数据锁，
/// 因而独占对数据的读写。生命周期结束时自动释放数据锁与引用。
pub struct Buf<'a, D: BlockDevice> {
    cache: &'a Bcache<D>,

    /// 缓冲块在缓冲池中的下标
    index: usize,
    dev: u32,
    blockno: u32,

    /// 所在桶。引用计数非 0 期间缓冲块不会被替换，所以该值保持不变
    bucket: usize,

    /// 在 `Drop` 中取出，此前始终有效
    data: ManuallyDrop<SleepLockGuard<'a, BufData>>,
}

impl<'a, D: BlockDevice> Buf<'a, D> {
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// 缓冲块当前的状态位
    pub fn flags(&self) -> BufFlags {
        self.cache.bufs[self.index].flags()
    }

    /// 数据是否与磁盘一致
    pub fn is_valid(&self) -> bool {
        self.flags().contains(BufFlags::VALID)
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.data
    }

    /// 提供指向缓冲区数据的原始常量指针。
    pub fn raw_data(&self) -> *const BufData {
        let guard: &BufData = &self.data;
        guard
    }

    /// 提供指向缓冲区数据的原始可变指针。
    pub fn raw_data_mut(&mut self) -> *mut BufData {
        let guard: &mut BufData = &mut self.data;
        guard
    }

    /// 若数据尚未有效，从磁盘读入一次并标记为有效。
    ///
    /// # 可能的错误
    /// - 调用者未持有数据锁时 panic。
    pub fn ensure_valid(&mut self) {
        self.check_holding("ensure_valid");
        if !self.is_valid() {
            self.transfer(false);
            self.cache.bufs[self.index].set(BufFlags::VALID);
        }
    }

    /// 把数据同步写回磁盘。
    ///
    /// # 可能的错误
    /// - 调用者未持有数据锁时 panic。
    pub fn bwrite(&mut self) {
        self.check_holding("bwrite");
        self.transfer(true);
    }

    /// 释放该缓冲块，等同于丢弃它。
    pub fn brelse(self) {
        drop(self);
    }

    /// 将引用计数加一，使该块在 `Buf` 释放后仍留在缓存中，需与 `unpin` 配对使用。
    pub fn pin(&self) {
        self.cache.adjust_ref(self.index, self.bucket, true);
    }

    /// 将引用计数减一，解除之前的 `pin`。
    ///
    /// # 可能的错误
    /// - 没有与之配对的 `pin` 时 panic。
    pub fn unpin(&self) {
        self.cache.adjust_ref(self.index, self.bucket, false);
    }

    fn check_holding(&self, what: &str) {
        if !self.data.holding() {
            log::error!("bcache: {} on buf {} without its lock", what, self.index);
            panic!("{}", what);
        }
    }

    /// 在数据与磁盘之间传输一次，期间缓冲块标记为由磁盘占用。
    fn transfer(&mut self, writing: bool) {
        let inner = &self.cache.bufs[self.index];
        if inner.set(BufFlags::DISK).contains(BufFlags::DISK) {
            panic!("bio: buf {} already owned by disk", self.index);
        }
        self.cache.disk.rw(self.dev, self.blockno, &mut self.data, writing);
        inner.clear(BufFlags::DISK);
    }
}

impl<'a, D: BlockDevice> Drop for Buf<'a, D> {
    fn drop(&mut self) {
        // SAFETY: `data` 只在这里取出一次，之后不再访问
        let data = unsafe { ManuallyDrop::take(&mut self.data) };
        if !data.holding() {
            // 数据锁不属于当前执行流，不能释放它，系统即将停机
            mem::forget(data);
            if thread::panicking() {
                return;
            }
            log::error!("bcache: release of buf {} without its lock", self.index);
            panic!("brelse");
        }
        drop(data);
        self.cache.brelse(self.index, self.bucket);
    }
}

/// 缓冲块的数据部分及其状态位。
struct BufInner {
    /// `BufFlags` 的位表示
    flags: AtomicU8,

    /// 缓冲块的实际数据，受睡眠锁保护
    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            flags: AtomicU8::new(0),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }

    fn flags(&self) -> BufFlags {
        BufFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// 置位并返回之前的状态
    fn set(&self, f: BufFlags) -> BufFlags {
        BufFlags::from_bits_truncate(self.flags.fetch_or(f.bits(), Ordering::AcqRel))
    }

    fn clear(&self, f: BufFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ramdisk::RamDisk;
    use core::sync::atomic::AtomicUsize;
    use std::any::Any;
    use std::panic;
    use std::sync::Barrier;

    fn cache(nbuf: usize, nbucket: usize) -> Bcache<RamDisk> {
        Bcache::new(RamDisk::new(2, 64), nbuf, nbucket)
    }

    fn touch(c: &Bcache<RamDisk>, blockno: u32) {
        c.bread(1, blockno).brelse();
    }

    fn message(e: Box<dyn Any + Send>) -> String {
        match e.downcast::<String>() {
            Ok(s) => *s,
            Err(e) => e.downcast::<&str>().map(|s| s.to_string()).unwrap_or_default(),
        }
    }

    #[test]
    fn four_buffers_two_buckets() {
        let c = cache(4, 2);
        for b in 0..4 {
            touch(&c, b);
        }
        assert_eq!(c.stats(), BcacheStats { hits: 0, misses: 4, evictions: 0 });
        assert_eq!(c.audit(), vec![(1, 0), (1, 1), (1, 2), (1, 3)]);

        touch(&c, 4);
        assert_eq!(c.stats().evictions, 1);
        assert!(!c.probe(1, 0));
        for b in 1..5 {
            assert!(c.probe(1, b));
        }
        c.audit();
    }

    #[test]
    fn hit_refreshes_recency() {
        let c = cache(4, 2);
        for b in 0..4 {
            touch(&c, b);
        }
        touch(&c, 0);
        assert_eq!(c.stats().hits, 1);

        touch(&c, 4);
        assert!(c.probe(1, 0));
        assert!(!c.probe(1, 1));
    }

    #[test]
    fn unused_buffers_go_first() {
        let c = cache(4, 2);
        touch(&c, 0);
        touch(&c, 1);
        // 块 0、1 都比空闲缓冲块"旧"，但空闲缓冲块先被使用
        touch(&c, 6);
        touch(&c, 9);
        assert_eq!(c.stats().evictions, 0);
        assert_eq!(c.audit(), vec![(1, 0), (1, 1), (1, 6), (1, 9)]);
    }

    #[test]
    fn held_buffer_is_never_evicted() {
        let c = cache(4, 2);
        let held = c.bread(1, 0);
        for b in 1..4 {
            touch(&c, b);
        }
        touch(&c, 4);
        assert!(c.probe(1, 0));
        assert!(!c.probe(1, 1));
        assert_eq!(held.read_blockno(), 0);
        drop(held);
        assert_eq!(c.refcnt(1, 0), Some(0));
    }

    #[test]
    fn devices_are_distinguished() {
        let c = cache(4, 2);
        let mut a = c.bread(0, 5);
        a.data_mut()[0] = 1;
        a.bwrite();
        drop(a);
        let b = c.bread(1, 5);
        assert_eq!(b.data()[0], 0);
        assert_eq!(b.dev(), 1);
        drop(b);
        assert_eq!(c.audit(), vec![(0, 5), (1, 5)]);
    }

    #[test]
    fn cached_payload_needs_no_second_read() {
        let c = cache(4, 2);
        let mut b = c.bread(1, 3);
        assert!(b.is_valid());
        b.data_mut()[..4].copy_from_slice(b"xv6!");
        b.bwrite();
        drop(b);

        let b = c.bread(1, 3);
        assert_eq!(&b.data()[..4], b"xv6!");
        drop(b);
        assert_eq!((c.disk().reads(), c.disk().writes()), (1, 1));
        assert_eq!(&c.disk().peek(1, 3)[..4], b"xv6!");
    }

    #[test]
    fn evicted_block_is_read_again() {
        let c = cache(2, 1);
        let mut b = c.bread(1, 0);
        b.data_mut()[7] = 42;
        b.bwrite();
        drop(b);
        touch(&c, 1);
        touch(&c, 2);
        assert!(!c.probe(1, 0));

        let b = c.bread(1, 0);
        assert_eq!(b.data()[7], 42);
        drop(b);
        assert_eq!(c.disk().reads(), 4);
    }

    #[test]
    fn bget_leaves_content_invalid() {
        let c = cache(2, 2);
        let mut b = c.bget(1, 3);
        assert!(b.flags().is_empty());
        b.ensure_valid();
        assert_eq!(b.flags(), BufFlags::VALID);
        b.ensure_valid();
        drop(b);
        assert_eq!(c.disk().reads(), 1);
    }

    #[test]
    fn pin_keeps_block_resident() {
        let c = cache(2, 1);
        let b = c.bread(1, 0);
        b.pin();
        drop(b);
        assert_eq!(c.refcnt(1, 0), Some(1));

        touch(&c, 1);
        touch(&c, 2);
        touch(&c, 3);
        assert!(c.probe(1, 0));

        let b = c.bread(1, 0);
        b.unpin();
        drop(b);
        assert_eq!(c.refcnt(1, 0), Some(0));
        // 块 0 刚被访问过，先替换块 3 的缓冲，再轮到它
        touch(&c, 4);
        assert!(c.probe(1, 0));
        touch(&c, 5);
        assert!(!c.probe(1, 0));
    }

    #[test]
    #[should_panic(expected = "bunpin: not pinned")]
    fn unpin_without_pin() {
        let c = cache(2, 1);
        let b = c.bread(1, 0);
        b.unpin();
    }

    #[test]
    fn unpaired_unpin_leaves_waiter_resident() {
        let c = cache(1, 1);
        let b = c.bread(1, 0);
        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let b = c.bread(1, 0);
                assert_eq!(c.refcnt(1, 0), Some(1));
                assert_eq!(b.read_blockno(), 0);
            });
            while c.refcnt(1, 0) != Some(2) {
                thread::yield_now();
            }

            let r = panic::catch_unwind(panic::AssertUnwindSafe(|| b.unpin()));
            assert_eq!(message(r.unwrap_err()), "bunpin: not pinned");
            assert_eq!(c.refcnt(1, 0), Some(2));
            drop(b);
            waiter.join().unwrap();
        });
        assert_eq!(c.refcnt(1, 0), Some(0));
        assert!(c.probe(1, 0));
    }

    #[test]
    fn pin_is_shared_across_holders() {
        let c = cache(1, 1);
        c.bread(1, 0).pin();
        let b = c.bread(1, 0);
        b.unpin();
        let r = panic::catch_unwind(panic::AssertUnwindSafe(|| b.unpin()));
        assert!(r.is_err());
        drop(b);
        assert_eq!(c.refcnt(1, 0), Some(0));
    }

    #[test]
    #[should_panic(expected = "bget: no buffers")]
    fn exhausted_by_holders() {
        let c = cache(3, 2);
        let _held: Vec<_> = (0..3).map(|b| c.bget(1, b)).collect();
        c.bget(1, 3);
    }

    #[test]
    #[should_panic(expected = "bget: no buffers")]
    fn exhausted_by_pins() {
        let c = cache(3, 2);
        for b in 0..3 {
            c.bget(1, b).pin();
        }
        c.bget(1, 3);
    }

    #[test]
    fn exhaustion_hit_still_served() {
        let c = cache(2, 2);
        let _a = c.bget(1, 0);
        let b = c.bget(1, 1);
        b.pin();
        drop(b);
        // 缓冲池已满，但命中不需要替换
        let again = c.bget(1, 1);
        assert_eq!(c.refcnt(1, 1), Some(2));
        drop(again);
    }

    #[test]
    fn write_from_another_thread_is_fatal() {
        let c = cache(2, 1);
        let b = c.bread(1, 0);
        let r = thread::scope(|s| {
            s.spawn(move || {
                let mut b = b;
                b.bwrite();
            })
            .join()
        });
        assert!(r.is_err());
        assert_eq!(c.disk().writes(), 0);
    }

    #[test]
    fn release_from_another_thread_is_fatal() {
        let c = cache(2, 1);
        let b = c.bread(1, 0);
        let r = thread::scope(|s| s.spawn(move || drop(b)).join());
        assert_eq!(message(r.unwrap_err()), "brelse");
        assert_eq!(c.refcnt(1, 0), Some(1));
        assert_eq!(c.disk().reads(), 1);
    }

    #[test]
    fn ensure_valid_from_another_thread_is_fatal() {
        let c = cache(2, 1);
        let b = c.bget(1, 0);
        let r = thread::scope(|s| {
            s.spawn(move || {
                let mut b = b;
                b.ensure_valid();
            })
            .join()
        });
        assert_eq!(message(r.unwrap_err()), "ensure_valid");
        assert_eq!(c.refcnt(1, 0), Some(1));
        assert_eq!(c.disk().reads(), 0);
    }

    #[test]
    fn many_buckets_miss() {
        // 未命中时同时持有 1 + 255 把自旋锁
        let c = Bcache::new(RamDisk::new(2, 512), 300, 255);
        for b in 0..300 {
            touch(&c, b);
        }
        touch(&c, 300);
        assert_eq!(c.stats().evictions, 1);
        assert!(!c.probe(1, 0));
        c.audit();
    }

    #[test]
    #[should_panic(expected = "binit: no buckets")]
    fn zero_buckets() {
        cache(4, 0);
    }

    #[test]
    fn one_holder_at_a_time() {
        const THREADS: usize = 6;
        const ROUNDS: usize = 300;

        let c = cache(8, 3);
        let inside = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        let mut b = c.bread(1, 5);
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        b.data_mut()[0] = b.data()[0].wrapping_add(1);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });
        let b = c.bread(1, 5);
        assert_eq!(b.data()[0], (THREADS * ROUNDS % 256) as u8);
        drop(b);
        assert_eq!(c.disk().reads(), 1);
    }

    #[test]
    fn racing_misses_share_one_buffer() {
        const THREADS: usize = 8;

        let c = cache(THREADS, 4);
        let start = Barrier::new(THREADS);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    start.wait();
                    c.bread(1, 9).brelse();
                });
            }
        });
        assert_eq!(c.audit(), vec![(1, 9)]);
        assert_eq!(c.stats().misses, 1);
        assert_eq!(c.stats().hits, THREADS as u64 - 1);
        assert_eq!(c.disk().reads(), 1);
    }

    #[test]
    fn stress_counters_survive_eviction() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 400;
        const KEYS: u32 = 16;

        let c = cache(6, 3);
        let expected: Vec<AtomicUsize> = (0..KEYS).map(|_| AtomicUsize::new(0)).collect();
        let inside: Vec<AtomicUsize> = (0..KEYS).map(|_| AtomicUsize::new(0)).collect();

        thread::scope(|s| {
            for t in 0..THREADS {
                let (c, expected, inside) = (&c, &expected, &inside);
                s.spawn(move || {
                    let mut x = 0x9e37_79b9u32 ^ (t as u32 + 1);
                    for _ in 0..ROUNDS {
                        x ^= x << 13;
                        x ^= x >> 17;
                        x ^= x << 5;
                        let key = x % KEYS;
                        let k = key as usize;

                        let mut b = c.bread(1, key);
                        assert_eq!(inside[k].fetch_add(1, Ordering::SeqCst), 0);
                        let n = u32::from_le_bytes(b.data()[..4].try_into().unwrap()) + 1;
                        b.data_mut()[..4].copy_from_slice(&n.to_le_bytes());
                        b.bwrite();
                        expected[k].fetch_add(1, Ordering::SeqCst);
                        inside[k].fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        c.audit();
        for key in 0..KEYS {
            let on_disk = u32::from_le_bytes(c.disk().peek(1, key)[..4].try_into().unwrap());
            assert_eq!(on_disk as usize, expected[key as usize].load(Ordering::SeqCst));
        }
        let stats = c.stats();
        assert_eq!(stats.hits + stats.misses, (THREADS * ROUNDS) as u64);
    }
}
