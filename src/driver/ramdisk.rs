//! 内存盘驱动
//!
//! 以一段内存模拟若干块设备，每次传输都同步完成。
//! 读写次数被记录下来，便于观察缓冲层实际产生了多少磁盘流量。

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::consts::fs::BSIZE;
use crate::fs::BufData;
use crate::spinlock::SpinLock;
use super::BlockDevice;

pub struct RamDisk {
    /// 设备数量，合法的设备号为 `0..ndev`
    ndev: u32,
    /// 每个设备的块数
    nblocks: u32,
    /// 所有设备的块内容，设备 `d` 的第 `b` 块位于 `d * nblocks + b`
    blocks: SpinLock<Vec<[u8; BSIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    /// 创建 `ndev` 个各含 `nblocks` 块、内容全零的设备。
    pub fn new(ndev: u32, nblocks: u32) -> Self {
        if ndev == 0 || nblocks == 0 {
            panic!("ramdisk: empty geometry");
        }
        let total = ndev as usize * nblocks as usize;
        Self {
            ndev,
            nblocks,
            blocks: SpinLock::new(vec![[0; BSIZE]; total], "ramdisk"),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 已完成的读传输次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 已完成的写传输次数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 绕过缓冲层直接查看设备上某一块的内容。
    pub fn peek(&self, dev: u32, blockno: u32) -> [u8; BSIZE] {
        let i = self.slot(dev, blockno);
        self.blocks.lock()[i]
    }

    fn slot(&self, dev: u32, blockno: u32) -> usize {
        if dev >= self.ndev || blockno >= self.nblocks {
            panic!("ramdisk: block ({}, {}) out of range", dev, blockno);
        }
        dev as usize * self.nblocks as usize + blockno as usize
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
        let i = self.slot(dev, blockno);
        let mut blocks = self.blocks.lock();
        if writing {
            blocks[i].copy_from_slice(&data[..]);
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            data.copy_from_slice(&blocks[i]);
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        drop(blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let disk = RamDisk::new(2, 8);
        let mut data = BufData::new();
        data[0] = 0xab;
        data[BSIZE - 1] = 0xcd;
        disk.rw(1, 7, &mut data, true);

        let mut back = BufData::new();
        disk.rw(1, 7, &mut back, false);
        assert_eq!(back[0], 0xab);
        assert_eq!(back[BSIZE - 1], 0xcd);
        assert_eq!(disk.peek(0, 7)[0], 0);
        assert_eq!((disk.reads(), disk.writes()), (1, 1));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range() {
        let disk = RamDisk::new(1, 4);
        disk.rw(0, 4, &mut BufData::new(), false);
    }
}
