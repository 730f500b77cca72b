//! 文件系统模块
//!
//! 只包含块缓冲层；inode、目录与日志等建立在它之上，不在本 crate 中。

mod bio;
mod bucket;

pub use bio::{Bcache, BcacheStats, Buf, BufData, BufFlags};
