//! 固定窗口限流器
//! 每个 key 一个计数窗口，窗口到期后从 1 重新计数

use dashmap::DashMap;
use serde::Serialize;
use std::time::{Duration, Instant};

/// 单个 key 的计数窗口
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    reset_at: Instant,
}

/// 限流判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// 当前窗口剩余时间
    pub reset_in: Duration,
}

pub struct FixedWindowLimiter {
    windows: DashMap<String, RateWindow>,
    max_requests: u32,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// 检查并计数
    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    /// 指定时间点检查；计数与窗口翻转在分片写锁内完成
    pub fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut entry = self.windows.entry(key.to_string()).or_insert(RateWindow {
            count: 0,
            reset_at: now + self.window,
        });

        if now >= entry.reset_at {
            *entry = RateWindow {
                count: 0,
                reset_at: now + self.window,
            };
        }

        let reset_in = entry.reset_at.saturating_duration_since(now);
        if entry.count >= self.max_requests {
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_in,
            };
        }

        entry.count += 1;
        RateDecision {
            allowed: true,
            remaining: self.max_requests - entry.count,
            reset_in,
        }
    }

    /// 删除已过期的窗口，返回删除数量
    pub fn trim(&self, now: Instant) -> u64 {
        let before = self.windows.len();
        self.windows.retain(|_, window| window.reset_at > now);
        before.saturating_sub(self.windows.len()) as u64
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            tracked_keys: self.windows.len(),
            max_requests: self.max_requests,
            window_secs: self.window.as_secs(),
        }
    }
}

/// 限流器统计
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub tracked_keys: usize,
    pub max_requests: u32,
    pub window_secs: u64,
}
