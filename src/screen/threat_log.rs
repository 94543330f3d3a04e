//! 有界威胁日志
//! 超出容量时淘汰最旧记录，按时间清理过期记录

use super::ThreatRecord;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

pub struct ThreatLog {
    entries: Mutex<VecDeque<ThreatRecord>>,
    capacity: usize,
}

impl ThreatLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ThreatRecord>> {
        // 持锁期间不会 panic，中毒时直接取回数据
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 追加记录，返回被淘汰的条数
    pub fn push(&self, record: ThreatRecord) -> usize {
        let mut entries = self.lock();
        entries.push_back(record);

        let mut evicted = 0;
        while entries.len() > self.capacity {
            entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// 最近的记录，最新的在前
    pub fn recent(&self, limit: usize) -> Vec<ThreatRecord> {
        self.lock().iter().rev().take(limit).cloned().collect()
    }

    /// 删除早于 `cutoff` 的记录
    pub fn trim_before(&self, cutoff: DateTime<Utc>) -> u64 {
        let mut entries = self.lock();
        let before = entries.len();
        // 按时间顺序追加，旧记录在队首
        while entries.front().is_some_and(|r| r.timestamp < cutoff) {
            entries.pop_front();
        }
        (before - entries.len()) as u64
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
