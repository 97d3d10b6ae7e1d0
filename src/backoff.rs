//! 重连指数退避
//!
//! 短间隔起步，每次失败翻倍，封顶；重连成功后重置回起始值。

use std::time::Duration;

/// 指数退避计时器
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// 取下一次等待时长，并把内部状态翻倍（封顶）
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// 连接成功后调用
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
