//! 硬件后端的异步完成通知
//!
//! 每个后端一个完成线程：异步等待方把 `Waker` 登记进 [`CompletionWakers`]，
//! 线程按最小的等待值分段阻塞在硬件等待原语上，值到达后取出对应任务并在释放锁之后唤醒。
//! 同一任务重复登记同一值只保留一份，线程数不随轮询次数增长。

use std::sync::Arc;
use std::task::Waker;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::core::error::{GraphicsError, Result};
use crate::renderer::sync::{self, CompletionWakers};

/// 单次硬件等待的上限，保证线程能及时响应新登记和关闭
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Default)]
struct WaiterState {
    wakers: CompletionWakers,
    stopping: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<WaiterState>,
    changed: Condvar,
}

/// 完成通知线程
pub(crate) struct CompletionThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl CompletionThread {
    /// 启动线程
    ///
    /// `wait(target, slice)` 最多阻塞 `slice`，返回硬件报告的已完成值。
    pub(crate) fn spawn<F>(name: &str, wait: F) -> Result<Self>
    where
        F: FnMut(u64, Duration) -> Result<u64> + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(thread_shared, wait))
            .map_err(|e| GraphicsError::Wait(format!("failed to spawn completion thread: {e}")))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// 登记一个等待 `value` 的任务
    pub(crate) fn register(&self, value: u64, waker: Waker) {
        self.shared.state.lock().wakers.register(value, waker);
        self.shared.changed.notify_one();
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.shared.state.lock().wakers.len()
    }
}

impl Drop for CompletionThread {
    fn drop(&mut self) {
        self.shared.state.lock().stopping = true;
        self.shared.changed.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run<F>(shared: Arc<Shared>, mut wait: F)
where
    F: FnMut(u64, Duration) -> Result<u64>,
{
    debug!("Completion thread started");
    let mut state = shared.state.lock();
    loop {
        if state.stopping {
            break;
        }

        let Some(target) = state.wakers.min_pending() else {
            shared.changed.wait(&mut state);
            continue;
        };

        let result = MutexGuard::unlocked(&mut state, || wait(target, WAIT_SLICE));
        let ready = match result {
            Ok(completed) => state.wakers.take_reached(completed),
            Err(e) => {
                // 任务醒来后重新登记，由后端把错误交给等待方
                warn!(error = %e, target, "Completion wait failed, waking all waiters");
                state.wakers.take_all()
            }
        };
        if !ready.is_empty() {
            MutexGuard::unlocked(&mut state, || sync::wake_all(ready));
        }
    }

    let rest = state.wakers.take_all();
    drop(state);
    sync::wake_all(rest);
    debug!("Completion thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::task::Wake;
    use std::time::Instant;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake_fence(completed: Arc<AtomicU64>) -> impl FnMut(u64, Duration) -> Result<u64> + Send + 'static {
        move |target, slice| {
            let deadline = Instant::now() + slice;
            while completed.load(Ordering::SeqCst) < target && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(completed.load(Ordering::SeqCst))
        }
    }

    fn wait_for_count(counter: &CountingWaker, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.0.load(Ordering::SeqCst) < expected && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), expected);
    }

    #[test]
    fn test_repeated_registration_is_deduplicated() {
        let completed = Arc::new(AtomicU64::new(0));
        let waiter = CompletionThread::spawn("test-completion", fake_fence(Arc::clone(&completed))).unwrap();

        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        for _ in 0..100 {
            waiter.register(3, waker.clone());
        }
        assert_eq!(waiter.pending(), 1);

        completed.store(3, Ordering::SeqCst);
        wait_for_count(&counter, 1);
        assert_eq!(waiter.pending(), 0);
    }

    #[test]
    fn test_wakes_in_value_order() {
        let completed = Arc::new(AtomicU64::new(0));
        let waiter = CompletionThread::spawn("test-completion", fake_fence(Arc::clone(&completed))).unwrap();

        let first = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let second = Arc::new(CountingWaker(AtomicUsize::new(0)));
        waiter.register(1, Waker::from(Arc::clone(&first)));
        waiter.register(2, Waker::from(Arc::clone(&second)));

        completed.store(1, Ordering::SeqCst);
        wait_for_count(&first, 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);

        completed.store(2, Ordering::SeqCst);
        wait_for_count(&second, 1);
    }

    #[test]
    fn test_drop_wakes_remaining_waiters() {
        let completed = Arc::new(AtomicU64::new(0));
        let waiter = CompletionThread::spawn("test-completion", fake_fence(completed)).unwrap();

        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        waiter.register(10, Waker::from(Arc::clone(&counter)));
        drop(waiter);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_error_wakes_everyone() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waiter = CompletionThread::spawn("test-completion", |_, _| {
            Err(GraphicsError::DeviceLost("gone".to_string()).into())
        })
        .unwrap();

        waiter.register(1, Waker::from(Arc::clone(&counter)));
        waiter.register(2, Waker::from(Arc::clone(&counter)));
        wait_for_count(&counter, 2);
    }
}
