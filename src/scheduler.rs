//! 后台清理任务调度
//! 固定间隔执行，带防重入保护，可取消

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 防重入标志：同一任务同一时刻只能有一个执行
#[derive(Debug, Default, Clone)]
pub struct SingleFlight {
    running: Arc<AtomicBool>,
}

/// 持有期间表示任务正在执行，Drop 时释放
#[derive(Debug)]
pub struct FlightGuard {
    running: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试开始执行；已在执行时返回 None
    pub fn try_begin(&self) -> Option<FlightGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                running: self.running.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// 清理任务：返回本次清理的条目数
pub type SweepJob = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<u64>> + Send + Sync>;

/// 单个后台任务句柄
pub struct SweepHandle {
    name: &'static str,
    cancel: watch::Sender<bool>,
    flight: SingleFlight,
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 当前是否有一次清理正在执行
    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    /// 取消任务并等待其退出（正在执行的一次清理会先完成）
    pub async fn cancel(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(job = self.name, error = %e, "Sweep task ended abnormally");
        }
    }
}

/// 后台任务调度器
#[derive(Default)]
pub struct SweepScheduler {
    handles: Vec<SweepHandle>,
}

impl SweepScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以固定间隔启动任务；第一次执行在一个间隔之后
    pub fn spawn(&mut self, name: &'static str, interval: Duration, job: SweepJob) {
        let handle = spawn_sweep(name, interval, job);
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// 取消所有任务
    pub async fn shutdown(self) {
        futures::future::join_all(self.handles.into_iter().map(SweepHandle::cancel)).await;
        tracing::info!("Background sweeps stopped");
    }
}

/// 启动单个清理任务
pub fn spawn_sweep(name: &'static str, interval: Duration, job: SweepJob) -> SweepHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let flight = SingleFlight::new();
    let task_flight = flight.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let Some(_guard) = task_flight.try_begin() else {
                        tracing::debug!(job = name, "Previous sweep still running, skipping tick");
                        continue;
                    };

                    match job().await {
                        Ok(removed) => {
                            metrics::counter!("sweep_removed_total", "job" => name).increment(removed);
                            tracing::debug!(job = name, removed, "Sweep completed");
                        }
                        Err(e) => {
                            tracing::error!(job = name, error = %e, "Sweep failed");
                        }
                    }
                }
            }
        }
    });

    SweepHandle {
        name,
        cancel: cancel_tx,
        flight,
        task,
    }
}
