//! 处理器状态管理，记录每个执行流的 hart 标识与关中断嵌套层数
//!
//! 在宿主环境中，每个内核线程被视为一个独立的虚拟 hart：
//! 它拥有唯一的 `cpu_id`，以及一份只由自己访问的 `Cpu` 状态。

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// 下一个可分配的 hart 标识
static NEXT_HART: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    static CPU: Cpu = Cpu::new();
}

/// 单个 hart 的本地状态。
///
/// 只由对应的执行流本地访问，因此使用 `Cell` 即可，无需额外同步。
struct Cpu {
    /// 该 hart 的唯一标识，在第一次访问时分配
    id: usize,

    /// 关闭中断的嵌套计数，表示当前持有的自旋锁层数。
    /// 每调用一次 `push_off` 计数加 1，每调用一次 `pop_off` 计数减 1。
    /// 缓存未命中时同时持有替换锁与全部桶锁，层数可达桶数加一。
    noff: Cell<usize>,
}

impl Cpu {
    fn new() -> Self {
        Self {
            id: NEXT_HART.fetch_add(1, Ordering::Relaxed),
            noff: Cell::new(0),
        }
    }
}

/// 返回当前 hart 的标识。
#[inline]
pub fn cpu_id() -> usize {
    CPU.with(|c| c.id)
}

/// # 功能说明
/// 关闭当前 hart 的中断，并记录嵌套次数。
/// 多次调用 `push_off()` 需要相应次数的 `pop_off()` 才能恢复。
///
/// 宿主环境下无法真正屏蔽中断，这里只维护嵌套计数，
/// 供 `sleep` 与睡眠锁检查"持有自旋锁时不得阻塞"这一约束。
///
/// # 可能的错误
/// - 嵌套层数溢出时 panic。
pub fn push_off() {
    CPU.with(|c| {
        let noff = c.noff.get();
        if noff == usize::MAX {
            panic!("push_off(): too many nested locks");
        }
        c.noff.set(noff + 1);
    });
}

/// # 功能说明
/// 解除之前通过 `push_off()` 记录的一层关中断。
///
/// # 可能的错误
/// - 如果调用次数与 `push_off()` 不匹配，panic。
pub fn pop_off() {
    CPU.with(|c| {
        match c.noff.get().checked_sub(1) {
            Some(noff) => c.noff.set(noff),
            None => panic!("pop_off(): count not match"),
        }
    });
}

/// 当前 hart 是否持有任何自旋锁。
pub fn holding_spinlocks() -> bool {
    CPU.with(|c| c.noff.get() != 0)
}
