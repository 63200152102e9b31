//! 可注入的单调时钟。
//!
//! - **意图 (Why)**：挂起 UDVM 的过期判定需要“当前时间”，测试必须能够确定性地推进它；
//! - **契约 (What)**：[`SystemClock`] 读取 `Instant::now()`；[`ManualClock`] 仅在显式 `advance` 时前进；
//! - **实现提示 (How)**：`ManualClock` 以 `Arc<Mutex<_>>` 共享状态，克隆后的句柄观察同一条时间轴。

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 统一的“获取当前时间”能力。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;
}

/// 生产环境使用的系统单调时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 手动推进的虚拟时钟。
///
/// # 教案式注释
/// - **意图 (Why)**：验证挂起超时回收时不依赖真实计时器；
/// - **契约 (What)**：`now = origin + elapsed`，`advance` 只会让时间前进；
/// - **注意 (Trade-offs)**：互斥锁保护偏移量，读多写少的测试场景下开销可忽略。
#[derive(Clone, Debug)]
pub struct ManualClock {
    inner: Arc<Mutex<ClockState>>,
}

#[derive(Debug)]
struct ClockState {
    origin: Instant,
    elapsed: Duration,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// 以当前系统时间为原点创建虚拟时钟。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
            })),
        }
    }

    /// 推进虚拟时间。
    pub fn advance(&self, delta: Duration) {
        let mut state = self.inner.lock();
        state.elapsed = state.elapsed.saturating_add(delta);
    }

    /// 自原点以来累计推进的时长。
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().elapsed
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock();
        state.origin + state.elapsed
    }
}
