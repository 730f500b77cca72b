//! 进程控制模块
//!
//! 只保留缓冲层需要的部分：hart 本地状态，以及基于等待通道的睡眠与唤醒。

use array_macro::array;

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use crate::consts::NWAITQ;
use crate::spinlock::{SpinLock, SpinLockGuard};

pub use cpu::{cpu_id, holding_spinlocks, pop_off, push_off};

mod cpu;

/// 全局进程管理器
///
/// 持有固定数量的等待队列，所有睡眠中的执行流按等待通道散列挂在其中。
/// 唤醒只需要锁住对应通道所在的那一个队列。
pub static PROC_MANAGER: ProcManager = ProcManager::new();

pub struct ProcManager {
    /// 等待队列表，长度为 `NWAITQ`
    waitq: [SpinLock<Vec<Sleeper>>; NWAITQ],
}

/// 一个挂在等待通道上的执行流
struct Sleeper {
    channel: usize,
    thread: Thread,
    /// 由 `wakeup` 置位，睡眠方据此区分真正的唤醒与伪唤醒
    woken: Arc<AtomicBool>,
}

impl ProcManager {
    const fn new() -> Self {
        Self {
            waitq: array![_ => SpinLock::new(Vec::new(), "waitq"); NWAITQ],
        }
    }

    fn queue(&self, channel: usize) -> &SpinLock<Vec<Sleeper>> {
        // 通道通常是按字对齐的地址，先去掉低位再取模
        &self.waitq[(channel >> 3) % NWAITQ]
    }

    /// # 功能说明
    /// 原子地释放传入的自旋锁，使当前执行流在通道 `channel` 上睡眠，
    /// 直到被 `wakeup` 唤醒。返回时不会重新获取传入的锁。
    ///
    /// # 流程解释
    /// 1. 先锁住通道所在的等待队列，再登记自己；
    /// 2. 释放调用者传入的锁 `guard`。由于唤醒方必须先拿到该锁才能改变条件，
    ///    再拿等待队列锁才能唤醒，登记完成后释放 `guard` 不会错过唤醒；
    /// 3. 释放等待队列锁，此时不得再持有任何自旋锁；
    /// 4. 挂起，直到 `woken` 被置位。
    ///
    /// # 可能的错误
    /// - 调用者在 `guard` 之外还持有其他自旋锁时 panic，阻塞时持有自旋锁会使其他 hart 无限自旋。
    pub fn sleep<T: ?Sized>(&self, channel: usize, guard: SpinLockGuard<'_, T>) {
        let woken = Arc::new(AtomicBool::new(false));
        let mut queue = self.queue(channel).lock();
        queue.push(Sleeper {
            channel,
            thread: thread::current(),
            woken: Arc::clone(&woken),
        });
        drop(guard);
        drop(queue);

        if holding_spinlocks() {
            panic!("sleep(): cpu hold multi locks");
        }

        while !woken.load(Ordering::Acquire) {
            thread::park();
        }
    }

    /// 唤醒所有阻塞在通道 `channel` 上的执行流。
    pub fn wakeup(&self, channel: usize) {
        let mut queue = self.queue(channel).lock();
        queue.retain(|s| {
            if s.channel != channel {
                return true;
            }
            s.woken.store(true, Ordering::Release);
            s.thread.unpark();
            false
        });
        drop(queue);
    }
}
