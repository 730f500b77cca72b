//! 睡眠锁模块
//! 提供基于睡眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的执行流会进入休眠状态，避免忙等待。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};

use crate::process::{cpu_id, holding_spinlocks, PROC_MANAGER};
use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的执行流会进入休眠状态，
/// 直到锁被释放后被唤醒。这避免了忙等待，适用于可能长时间持有的锁，
/// 例如跨越一次磁盘传输的缓冲块数据。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`与`holder`
/// - `locked`: 表示锁是否已被占用
/// - `holder`: 持有者的 hart ID，供 `holding` 检查
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    holder: Cell<usize>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// `locked` 与 `holder` 只在持有内部自旋锁时访问
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            holder: Cell::new(0),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：调用`sleep()`让当前执行流休眠，被唤醒后重新检查
    ///   - 如果未锁定：设置`locked=true`并记录持有者
    /// 3. 释放内部自旋锁
    ///
    /// # 可能的错误
    /// - 调用者持有任何自旋锁时 panic：阻塞期间其他 hart 会在该自旋锁上无限自旋。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        if holding_spinlocks() {
            panic!("sleeplock {} acquire: holding spinlock", self.name);
        }

        let mut guard = self.lock.lock();
        while self.locked.get() {
            PROC_MANAGER.sleep(self.locked.as_ptr() as usize, guard);
            guard = self.lock.lock();
        }
        self.locked.set(true);
        self.holder.set(cpu_id());
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() }
        }
    }

    /// 当前执行流是否持有该睡眠锁
    pub fn holding(&self) -> bool {
        let guard = self.lock.lock();
        let r = self.locked.get() && self.holder.get() == cpu_id();
        drop(guard);
        r
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    ///
    /// 标记锁为可用，并唤醒所有在`locked`地址上休眠的执行流
    fn unlock(&self) {
        let guard = self.lock.lock();
        if !self.locked.get() || self.holder.get() != cpu_id() {
            panic!("sleeplock {} release", self.name);
        }
        self.locked.set(false);
        PROC_MANAGER.wakeup(self.locked.as_ptr() as usize);
        drop(guard);
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 守卫离开作用域时自动释放锁。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
