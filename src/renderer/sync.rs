//! GPU 同步机制模块
//!
//! 提供 CPU-GPU 同步的基础类型。
//!
//! # 设计原则
//!
//! - **Fence 值**：单调递增的强类型计数器，每次 signal 恰好递增一次
//! - **完成判定**：硬件报告的已完成值 `>= v` 时，值 `v` 视为已到达
//! - **唤醒登记**：异步等待方按 Fence 值登记 `Waker`，后端在完成推进时统一唤醒

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::task::Waker;

use super::command::QueueId;

/// Fence 值
///
/// 用于 CPU-GPU 同步的单调递增值。一个队列的 Fence 值从 0 开始，
/// 每次 `signal()` 递增一次，从不递减，也不跨队列复用。
///
/// 队列产生的值带有所属队列的标记，交给别的队列等待会被拒绝。
/// 比较、排序和哈希只看序号，不看标记。
#[derive(Debug, Clone, Copy, Default)]
pub struct FenceValue {
    value: u64,
    /// 所属队列，0 表示未标记
    owner: u64,
}

impl FenceValue {
    /// 初始值，任何队列创建时都已到达
    pub const ZERO: FenceValue = FenceValue { value: 0, owner: 0 };

    /// 创建新的（未标记所属队列的）Fence 值
    pub const fn new(value: u64) -> Self {
        Self { value, owner: 0 }
    }

    pub(crate) const fn owned_by(value: u64, queue: QueueId) -> Self {
        Self { value, owner: queue.0 }
    }

    /// 获取内部值，用于与硬件报告的已完成值比较
    pub const fn get(&self) -> u64 {
        self.value
    }

    /// 产生该值的队列，手工构造的值返回 `None`
    pub fn owner(&self) -> Option<QueueId> {
        (self.owner != 0).then_some(QueueId(self.owner))
    }

    /// 下一个 Fence 值
    ///
    /// 纯函数，不修改自身，保留所属队列。
    #[must_use]
    pub const fn increment(&self) -> Self {
        Self {
            value: self.value + 1,
            owner: self.owner,
        }
    }

    /// 给定硬件已完成值时，本值是否已到达
    pub const fn is_reached_by(&self, completed: u64) -> bool {
        completed >= self.value
    }
}

impl PartialEq for FenceValue {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for FenceValue {}

impl PartialOrd for FenceValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FenceValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl Hash for FenceValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl From<FenceValue> for u64 {
    fn from(value: FenceValue) -> Self {
        value.value
    }
}

/// 按 Fence 值登记的唤醒列表
///
/// 后端在已完成值推进后调用 [`CompletionWakers::take_reached`] 取出到期的任务，
/// 释放自己的锁之后再逐个唤醒。唤醒时执行器可能立即重新轮询，
/// 重新进入后端登记，所以唤醒不能发生在持锁期间。
#[derive(Debug, Default)]
pub struct CompletionWakers {
    pending: Vec<(u64, Waker)>,
}

impl CompletionWakers {
    /// 创建空列表
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个等待 `value` 的任务
    ///
    /// 同一任务重复登记同一值时只保留最新的 `Waker`。
    pub fn register(&mut self, value: u64, waker: Waker) {
        if let Some(slot) = self
            .pending
            .iter_mut()
            .find(|(v, w)| *v == value && w.will_wake(&waker))
        {
            slot.1 = waker;
            return;
        }
        self.pending.push((value, waker));
    }

    /// 取出所有等待值 `<= completed` 的任务
    pub fn take_reached(&mut self, completed: u64) -> Vec<Waker> {
        let mut reached = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].0 <= completed {
                reached.push(self.pending.swap_remove(i).1);
            } else {
                i += 1;
            }
        }
        reached
    }

    /// 取出全部任务（后端关闭或出错时使用，任务醒来后会重新检查状态）
    pub fn take_all(&mut self) -> Vec<Waker> {
        self.pending.drain(..).map(|(_, waker)| waker).collect()
    }

    /// 等待中的最小 Fence 值
    pub fn min_pending(&self) -> Option<u64> {
        self.pending.iter().map(|(value, _)| *value).min()
    }

    /// 尚未唤醒的任务数
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// 是否没有等待中的任务
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// 唤醒一批任务
pub fn wake_all(wakers: Vec<Waker>) {
    for waker in wakers {
        waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_fence_value() {
        let fence = FenceValue::new(0);
        assert_eq!(fence.get(), 0);

        let next = fence.increment();
        assert_eq!(next.get(), 1);
        assert_eq!(fence.get(), 0); // 原值不变
        assert_eq!(next.increment().get(), 2);
    }

    #[test]
    fn test_fence_ordering() {
        let f1 = FenceValue::new(1);
        let f2 = FenceValue::new(2);
        let f3 = FenceValue::new(1);

        assert!(f1 < f2);
        assert!(f2 > f1);
        assert_eq!(f1, f3);
        assert_eq!(FenceValue::default(), FenceValue::ZERO);
    }

    #[test]
    fn test_is_reached_by() {
        let v = FenceValue::new(5);
        assert!(!v.is_reached_by(4));
        assert!(v.is_reached_by(5));
        assert!(v.is_reached_by(6));
        assert!(FenceValue::ZERO.is_reached_by(0));
    }

    #[test]
    fn test_owner_tag_does_not_affect_ordering() {
        let tagged = FenceValue::owned_by(3, QueueId(9));
        assert_eq!(tagged, FenceValue::new(3));
        assert_eq!(tagged.owner(), Some(QueueId(9)));
        assert_eq!(tagged.increment().owner(), Some(QueueId(9)));
        assert_eq!(FenceValue::new(3).owner(), None);
        assert!(FenceValue::owned_by(2, QueueId(1)) < FenceValue::owned_by(3, QueueId(2)));
    }

    #[test]
    fn test_completion_wakers() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());

        let mut wakers = CompletionWakers::new();
        wakers.register(2, waker.clone());
        wakers.register(2, waker.clone());
        wakers.register(4, waker.clone());
        assert_eq!(wakers.len(), 2);
        assert_eq!(wakers.min_pending(), Some(2));

        assert!(wakers.take_reached(1).is_empty());
        let reached = wakers.take_reached(3);
        assert_eq!(reached.len(), 1);
        // 取出时不唤醒
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        wake_all(reached);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(wakers.len(), 1);
        assert_eq!(wakers.min_pending(), Some(4));

        wake_all(wakers.take_all());
        assert!(wakers.is_empty());
        assert_eq!(wakers.min_pending(), None);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
