//! 设备驱动模块
//!
//! 缓冲层只通过 [`BlockDevice`] 与块设备交互，具体的驱动由宿主内核提供。

use crate::fs::BufData;

pub mod ramdisk;

/// 块设备驱动接口
pub trait BlockDevice: Sync {
    /// 同步地在 `data` 与设备 `dev` 的第 `blockno` 块之间传输一个完整的块，
    /// 返回即表示传输完成。
    ///
    /// - `writing == false`：从设备读入 `data`；
    /// - `writing == true`：把 `data` 写到设备。
    ///
    /// 对同一缓冲块，在其数据锁被持有期间不会被重入调用。
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool);
}
