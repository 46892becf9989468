//! 自旋锁
//!
//! 工作线程求值期间保持锁定，消费端在交换缓冲区或读取共享状态前调用 `wait`。
//! 这是忙等待的互斥原语，不排队，持有期间不要做无关的工作。

use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// 尝试加锁，已被持有时立即返回 false
    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// 加锁，必要时自旋等待
    ///
    /// 与 `release` 成对使用；加锁和解锁可以发生在不同线程。
    pub fn acquire(&self) {
        while !self.try_acquire() {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// 加锁并返回作用域守卫
    pub fn lock(&self) -> SpinlockGuard<'_> {
        self.acquire();
        SpinlockGuard { lock: self }
    }

    /// 等待锁被释放，不获取锁
    pub fn wait(&self) {
        while self.locked.load(Ordering::Acquire) {
            hint::spin_loop();
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

/// 离开作用域时自动解锁
#[must_use]
pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
