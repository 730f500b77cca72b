//! 缓冲池的哈希桶表
//!
//! 每个缓冲块的控制信息（`BufCtrl`）存放在一个固定的数组中，
//! 各个桶用槽位下标串成双向链表。控制信息由它当前所属桶的自旋锁保护，
//! 因此所有访问都要求调用者出示对应桶的 `&Bucket` / `&mut Bucket`，
//! 而 `Bucket` 只能通过 `SpinLock` 的守卫拿到。

use core::cell::UnsafeCell;

use crate::spinlock::{SpinLock, SpinLockGuard};

/// 链表中表示"无"的槽位下标
pub(super) const NONE: usize = usize::MAX;

/// 从未被使用过的缓冲块的时间戳，小于任何真实时间戳
pub(super) const UNUSED: u64 = 0;

/// 缓冲块控制结构，记录缓冲块的身份、引用计数与链表位置。
pub(super) struct BufCtrl {
    pub(super) dev: u32,
    pub(super) blockno: u32,

    /// 当前持有者数量（获取与钉住都计入），为 0 时才可被替换
    pub(super) refcnt: usize,

    /// `refcnt` 中由 `pin` 贡献的部分，`unpin` 只能解除这一部分
    pub(super) pins: usize,

    /// 最近一次获取或释放时的逻辑时钟，`UNUSED` 表示从未使用
    pub(super) ticks: u64,

    /// 所在桶的下标，始终与链表归属一致
    bucket: usize,

    prev: usize,
    next: usize,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            refcnt: 0,
            pins: 0,
            ticks: UNUSED,
            bucket: 0,
            prev: NONE,
            next: NONE,
        }
    }
}

/// 持有全部桶锁时读到的控制信息快照
#[derive(Clone, Copy, Debug)]
pub(super) struct CtrlView {
    pub(super) dev: u32,
    pub(super) blockno: u32,
    pub(super) refcnt: usize,
    pub(super) ticks: u64,
    pub(super) bucket: usize,
}

/// 一个哈希桶，只能经由其自旋锁访问
pub(super) struct Bucket {
    index: usize,
    head: usize,
}

impl Bucket {
    pub(super) fn index(&self) -> usize {
        self.index
    }
}

pub(super) struct BucketTable {
    buckets: Box<[SpinLock<Bucket>]>,
    ctrls: Box<[UnsafeCell<BufCtrl>]>,
}

// 每个 `BufCtrl` 只在持有其所属桶的锁时访问
unsafe impl Sync for BucketTable {}

impl BucketTable {
    /// 创建 `nbuf` 个缓冲块并轮流分配到 `nbucket` 个桶中，
    /// 每个桶内后加入的缓冲块位于链表头部。
    pub(super) fn new(nbuf: usize, nbucket: usize) -> Self {
        let mut ctrls: Vec<BufCtrl> = (0..nbuf).map(|_| BufCtrl::new()).collect();
        let mut heads = vec![NONE; nbucket];

        for i in 0..nbuf {
            let b = i % nbucket;
            let old = heads[b];
            if old != NONE {
                ctrls[old].prev = i;
            }
            ctrls[i].next = old;
            ctrls[i].bucket = b;
            heads[b] = i;
        }

        Self {
            buckets: heads
                .into_iter()
                .enumerate()
                .map(|(index, head)| SpinLock::new(Bucket { index, head }, "bcache"))
                .collect(),
            ctrls: ctrls.into_iter().map(UnsafeCell::new).collect(),
        }
    }

    pub(super) fn nbuf(&self) -> usize {
        self.ctrls.len()
    }

    pub(super) fn nbucket(&self) -> usize {
        self.buckets.len()
    }

    /// 块号对应的桶
    pub(super) fn hash(&self, blockno: u32) -> usize {
        blockno as usize % self.buckets.len()
    }

    pub(super) fn lock(&self, bucket: usize) -> SpinLockGuard<'_, Bucket> {
        self.buckets[bucket].lock()
    }

    /// 按下标递增的顺序获取全部桶锁。
    ///
    /// 调用者必须已持有全局替换锁；除此之外任何路径都不会在持有桶锁时
    /// 再去申请替换锁或更小下标的桶锁，两者共同保证不会死锁。
    pub(super) fn lock_all(&self) -> Vec<SpinLockGuard<'_, Bucket>> {
        self.buckets.iter().map(|b| b.lock()).collect()
    }

    /// 在桶内查找 `(dev, blockno)` 对应的缓冲块。
    pub(super) fn find(&self, bucket: &Bucket, dev: u32, blockno: u32) -> Option<usize> {
        let mut i = bucket.head;
        while i != NONE {
            // SAFETY: 链表中的槽位都属于 `bucket`，调用者持有其锁
            let c = unsafe { &*self.ctrls[i].get() };
            if c.dev == dev && c.blockno == blockno && c.ticks != UNUSED {
                return Some(i);
            }
            i = c.next;
        }
        None
    }

    /// 取得 `bucket` 中槽位 `index` 的控制信息。
    ///
    /// 返回的引用借用了 `bucket`，在它存活期间无法再通过同一个桶取得其他引用。
    pub(super) fn ctrl_mut<'g>(&self, bucket: &'g mut Bucket, index: usize) -> &'g mut BufCtrl {
        // SAFETY: 持有 `bucket` 的锁，且对它的独占借用排除了别名
        let c = unsafe { &mut *self.ctrls[index].get() };
        debug_assert_eq!(c.bucket, bucket.index, "bcache: buf {} in wrong bucket", index);
        c
    }

    /// 读取任意槽位的控制信息，要求持有全部桶锁。
    pub(super) fn view(&self, all: &[SpinLockGuard<'_, Bucket>], index: usize) -> CtrlView {
        debug_assert_eq!(all.len(), self.buckets.len());
        // SAFETY: 全部桶锁都已持有
        let c = unsafe { &*self.ctrls[index].get() };
        CtrlView {
            dev: c.dev,
            blockno: c.blockno,
            refcnt: c.refcnt,
            ticks: c.ticks,
            bucket: c.bucket,
        }
    }

    /// # 功能说明
    /// 在整个缓冲池中挑选替换对象，要求持有全部桶锁。
    ///
    /// # 流程解释
    /// - 遇到从未使用过的缓冲块立即选中并停止扫描；
    /// - 否则维护一个候选：引用计数为 0 的缓冲块总能替换引用计数非 0 的候选，
    ///   引用计数同为 0 时时间戳更小者胜出（最近最少使用）。
    ///
    /// # 返回值
    /// 候选槽位。若其引用计数仍非 0，说明所有缓冲块都在使用中，由调用者处理。
    pub(super) fn select_victim(&self, all: &[SpinLockGuard<'_, Bucket>]) -> usize {
        let mut lru = 0;
        for i in 0..self.ctrls.len() {
            let b = self.view(all, i);
            if b.ticks == UNUSED && b.refcnt == 0 {
                return i;
            }
            let cur = self.view(all, lru);
            if b.refcnt == 0 && (cur.refcnt != 0 || b.ticks < cur.ticks) {
                lru = i;
            }
        }
        lru
    }

    /// 把槽位 `index` 从 `bucket` 的链表中摘下。
    pub(super) fn unlink(&self, bucket: &mut Bucket, index: usize) {
        let (prev, next) = {
            let c = self.ctrl_mut(bucket, index);
            let links = (c.prev, c.next);
            c.prev = NONE;
            c.next = NONE;
            links
        };
        // SAFETY: 前驱与后继都在同一个桶内，受同一把锁保护
        unsafe {
            match prev {
                NONE => bucket.head = next,
                p => (*self.ctrls[p].get()).next = next,
            }
            if next != NONE {
                (*self.ctrls[next].get()).prev = prev;
            }
        }
    }

    /// 把已摘下的槽位 `index` 插入 `bucket` 的链表头部，并更新其桶下标。
    pub(super) fn push_front(&self, bucket: &mut Bucket, index: usize) {
        let old = bucket.head;
        if old != NONE {
            // SAFETY: 原头部属于 `bucket`，受其锁保护
            let head = unsafe { &mut *self.ctrls[old].get() };
            if head.prev != NONE {
                panic!("bcache: bucket {} head has a prev", bucket.index);
            }
            head.prev = index;
        }
        // SAFETY: 槽位已从原桶摘下，调用者同时持有原桶与 `bucket` 的锁
        let c = unsafe { &mut *self.ctrls[index].get() };
        c.prev = NONE;
        c.next = old;
        c.bucket = bucket.index;
        bucket.head = index;
    }

    /// 桶内的全部槽位，按链表顺序。
    #[cfg(any(test, feature = "verbose_init_info"))]
    pub(super) fn members(&self, bucket: &Bucket) -> Vec<usize> {
        let mut out = Vec::new();
        let mut i = bucket.head;
        while i != NONE {
            out.push(i);
            // SAFETY: 同 `find`
            i = unsafe { (*self.ctrls[i].get()).next };
        }
        out
    }
}
