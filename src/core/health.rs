//! 健康监控
//!
//! 周期性汇总页面加载、投递成败、错误数与最近响应时间，按阈值给出 healthy / warning / critical，
//! 历史快照有上限。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

/// 阈值与容量
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub error_rate_warning: f64,
    pub response_time_warning: Duration,
    pub memory_critical_ratio: f64,
    pub history_size: usize,
    pub response_samples: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            error_rate_warning: 0.3,
            response_time_warning: Duration::from_secs(10),
            memory_critical_ratio: 0.9,
            history_size: 24,
            response_samples: 100,
        }
    }
}

/// 内存占用探针：返回已用 / 上限，无法观测时返回 None
pub trait MemorySource: Send + Sync {
    fn usage_ratio(&self) -> Option<f64>;
}

/// 读取 /proc：进程 RSS / 物理内存
#[derive(Debug, Default)]
pub struct ProcMemorySource;

impl ProcMemorySource {
    fn read_kb(path: &str, field: &str) -> Option<f64> {
        let content = std::fs::read_to_string(path).ok()?;
        content
            .lines()
            .find(|line| line.starts_with(field))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }
}

impl MemorySource for ProcMemorySource {
    fn usage_ratio(&self) -> Option<f64> {
        let rss = Self::read_kb("/proc/self/status", "VmRSS:")?;
        let total = Self::read_kb("/proc/meminfo", "MemTotal:")?;
        (total > 0.0).then(|| rss / total)
    }
}

/// 固定值探针（测试用）
#[derive(Debug, Default)]
pub struct FixedMemorySource(pub Option<f64>);

impl MemorySource for FixedMemorySource {
    fn usage_ratio(&self) -> Option<f64> {
        self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub page_loads: u64,
    pub application_success: u64,
    pub application_failure: u64,
    pub errors: u64,
    pub average_response_time_ms: f64,
    pub response_samples: usize,
    pub memory_usage_ratio: Option<f64>,
}

impl HealthMetrics {
    /// failed / (succeeded + failed)；尚无投递时为 0
    pub fn error_rate(&self) -> f64 {
        let total = self.application_success + self.application_failure;
        if total == 0 {
            0.0
        } else {
            self.application_failure as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub metrics: HealthMetrics,
    pub status: HealthStatus,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub snapshot: Option<HealthSnapshot>,
    pub uptime_secs: u64,
    pub total_applications: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub status: HealthStatus,
}

#[derive(Debug, Default)]
struct Counters {
    page_loads: u64,
    success: u64,
    failure: u64,
    errors: u64,
    response_times: VecDeque<Duration>,
}

/// 健康监控器
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    memory: Arc<dyn MemorySource>,
    started: Instant,
    counters: Mutex<Counters>,
    history: Mutex<VecDeque<HealthSnapshot>>,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            memory: Arc::new(ProcMemorySource),
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_memory_source(mut self, source: Arc<dyn MemorySource>) -> Self {
        self.memory = source;
        self
    }

    pub fn record_page_load(&self) {
        if let Ok(mut c) = self.counters.lock() {
            c.page_loads += 1;
        }
    }

    pub fn record_application(&self, success: bool) {
        if let Ok(mut c) = self.counters.lock() {
            if success {
                c.success += 1;
            } else {
                c.failure += 1;
            }
        }
    }

    pub fn record_error(&self) {
        if let Ok(mut c) = self.counters.lock() {
            c.errors += 1;
        }
    }

    /// 记录一次响应时间；只保留最近 response_samples 条
    pub fn record_response_time(&self, elapsed: Duration) {
        if let Ok(mut c) = self.counters.lock() {
            c.response_times.push_back(elapsed);
            while c.response_times.len() > self.thresholds.response_samples {
                c.response_times.pop_front();
            }
        }
    }

    fn metrics(&self) -> HealthMetrics {
        let memory_usage_ratio = self.memory.usage_ratio();
        let Ok(c) = self.counters.lock() else {
            return HealthMetrics {
                memory_usage_ratio,
                ..HealthMetrics::default()
            };
        };
        let samples = c.response_times.len();
        let average_response_time_ms = if samples == 0 {
            0.0
        } else {
            c.response_times.iter().map(|d| d.as_secs_f64() * 1000.0).sum::<f64>() / samples as f64
        };
        HealthMetrics {
            page_loads: c.page_loads,
            application_success: c.success,
            application_failure: c.failure,
            errors: c.errors,
            average_response_time_ms,
            response_samples: samples,
            memory_usage_ratio,
        }
    }

    fn evaluate(&self, metrics: &HealthMetrics) -> (HealthStatus, Vec<String>) {
        let mut issues = Vec::new();
        let mut status = HealthStatus::Healthy;

        let error_rate = metrics.error_rate();
        if error_rate > self.thresholds.error_rate_warning {
            issues.push(format!("high application failure rate: {:.0}%", error_rate * 100.0));
            status = HealthStatus::Warning;
        }

        let limit_ms = self.thresholds.response_time_warning.as_secs_f64() * 1000.0;
        if metrics.average_response_time_ms > limit_ms {
            issues.push(format!(
                "slow responses: average {:.0}ms",
                metrics.average_response_time_ms
            ));
            status = HealthStatus::Warning;
        }

        if let Some(ratio) = metrics.memory_usage_ratio {
            if ratio > self.thresholds.memory_critical_ratio {
                issues.push(format!("memory usage at {:.0}%", ratio * 100.0));
                status = HealthStatus::Critical;
            }
        }

        (status, issues)
    }

    /// 生成快照并追加到历史
    pub fn check(&self) -> HealthSnapshot {
        let metrics = self.metrics();
        let (status, issues) = self.evaluate(&metrics);
        let snapshot = HealthSnapshot {
            timestamp: Utc::now(),
            metrics,
            status,
            issues,
        };

        match status {
            HealthStatus::Healthy => tracing::debug!("health check: healthy"),
            HealthStatus::Warning => {
                tracing::warn!(issues = ?snapshot.issues, "health check: warning")
            }
            HealthStatus::Critical => {
                tracing::error!(issues = ?snapshot.issues, "health check: critical")
            }
        }

        if let Ok(mut history) = self.history.lock() {
            history.push_back(snapshot.clone());
            while history.len() > self.thresholds.history_size {
                history.pop_front();
            }
        }
        snapshot
    }

    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.history.lock().ok().and_then(|h| h.back().cloned())
    }

    pub fn history(&self) -> Vec<HealthSnapshot> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// 最新快照 + 汇总；状态按当前计数即时计算
    pub fn report(&self) -> HealthReport {
        let metrics = self.metrics();
        let (status, _) = self.evaluate(&metrics);
        let total_applications = metrics.application_success + metrics.application_failure;
        let success_rate = if total_applications == 0 {
            0.0
        } else {
            metrics.application_success as f64 / total_applications as f64
        };
        HealthReport {
            snapshot: self.latest(),
            uptime_secs: self.uptime().as_secs(),
            total_applications,
            success_rate,
            average_response_time_ms: metrics.average_response_time_ms,
            status,
        }
    }

    /// 后台周期检查，cancel 后退出
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("health monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.check();
                    }
                }
            }
        })
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}
