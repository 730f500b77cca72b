//! 内核常量

/// 等待队列表的槽数，`sleep`/`wakeup` 按通道地址散列到其中某一槽。
pub const NWAITQ: usize = 16;

pub mod fs {
    /// 缓冲池中缓冲块的默认数量
    pub const NBUF: usize = 30;

    /// 缓冲池的默认哈希桶数量，取素数以便块号分布均匀
    pub const NBUCKET: usize = 13;

    /// 磁盘块大小（字节）
    pub const BSIZE: usize = 1024;
}
