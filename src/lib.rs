//! 多核内核的块缓冲层
//!
//! 把 `(设备号, 块号)` 映射到固定数量的内存缓冲块上：命中只锁一个桶，
//! 未命中由全局替换锁串行处理并按最近最少使用策略回收缓冲块，
//! 每个缓冲块的数据由睡眠锁保护，同一时刻只允许一个持有者访问。

#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

pub mod consts;
pub mod driver;
pub mod fs;
pub mod process;
pub mod sleeplock;
pub mod spinlock;

pub use driver::{ramdisk::RamDisk, BlockDevice};
pub use fs::{Bcache, BcacheStats, Buf, BufData, BufFlags};
