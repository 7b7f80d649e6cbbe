//! 上下文共享状态使用的同步原语。
//!
//! 默认基于 `parking_lot`；启用 `loom-model` 特性时切换到 Loom 的可建模版本，
//! 让 `tests/loom_handshakes.rs` 穷举真实 [`crate::StreamerContext`] 的线程交错。
//! `Arc` 保持标准实现。
//!
//! 两套实现对外暴露相同的最小接口：
//! - [`Mutex`]：`lock` 直接返回守卫；
//! - [`CompletionLock`]：完成队列的锁，临界区以闭包表达，闭包内不得再次进入同一把锁；
//! - [`WakeSignal`]：粘性唤醒标志 + 条件变量。

#[cfg(not(feature = "loom-model"))]
mod imp {
    use std::{cell::RefCell, time::Duration};

    pub(crate) use parking_lot::Mutex;
    pub(crate) use std::sync::atomic::{AtomicBool, Ordering};

    /// 可重入锁：同一线程在回调中再次标记完成不会自锁。
    pub(crate) struct CompletionLock<T> {
        inner: parking_lot::ReentrantMutex<RefCell<T>>,
    }

    impl<T> CompletionLock<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: parking_lot::ReentrantMutex::new(RefCell::new(value)),
            }
        }

        pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
            let guard = self.inner.lock();
            let mut value = guard.borrow_mut();
            f(&mut *value)
        }
    }

    pub(crate) struct WakeSignal {
        woken: parking_lot::Mutex<bool>,
        signal: parking_lot::Condvar,
    }

    impl WakeSignal {
        pub(crate) fn new() -> Self {
            Self {
                woken: parking_lot::Mutex::new(false),
                signal: parking_lot::Condvar::new(),
            }
        }

        pub(crate) fn wake(&self) {
            let mut woken = self.woken.lock();
            if !*woken {
                *woken = true;
                self.signal.notify_one();
            }
        }

        /// 阻塞直到被唤醒或超时，消费标志并返回是否由唤醒结束。
        pub(crate) fn wait(&self, timeout: Duration) -> bool {
            let mut woken = self.woken.lock();
            if !*woken {
                let _ = self.signal.wait_for(&mut woken, timeout);
            }
            std::mem::replace(&mut *woken, false)
        }
    }
}

#[cfg(feature = "loom-model")]
mod imp {
    use std::{sync::PoisonError, time::Duration};

    pub(crate) use loom::sync::atomic::{AtomicBool, Ordering};

    pub(crate) struct Mutex<T> {
        inner: loom::sync::Mutex<T>,
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: loom::sync::Mutex::new(value),
            }
        }

        pub(crate) fn lock(&self) -> loom::sync::MutexGuard<'_, T> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Loom 没有可重入锁；完成队列的临界区从不嵌套，普通互斥锁即可建模。
    pub(crate) struct CompletionLock<T> {
        inner: Mutex<T>,
    }

    impl<T> CompletionLock<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: Mutex::new(value),
            }
        }

        pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
            let mut guard = self.inner.lock();
            f(&mut *guard)
        }
    }

    pub(crate) struct WakeSignal {
        woken: Mutex<bool>,
        signal: loom::sync::Condvar,
    }

    impl WakeSignal {
        pub(crate) fn new() -> Self {
            Self {
                woken: Mutex::new(false),
                signal: loom::sync::Condvar::new(),
            }
        }

        pub(crate) fn wake(&self) {
            let mut woken = self.woken.lock();
            if !*woken {
                *woken = true;
                self.signal.notify_one();
            }
        }

        /// Loom 不建模超时：一直等到被唤醒。
        pub(crate) fn wait(&self, _timeout: Duration) -> bool {
            let mut woken = self.woken.lock();
            while !*woken {
                woken = self
                    .signal
                    .wait(woken)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            std::mem::replace(&mut *woken, false)
        }
    }
}

pub(crate) use imp::{AtomicBool, CompletionLock, Mutex, Ordering, WakeSignal};
