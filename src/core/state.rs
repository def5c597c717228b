//! 状态定义：会话状态机与进度计数
//!
//! 状态图：created → starting → running ⇄ paused → {stopped | completed | failed}。
//! created / starting 也可直接进入 stopped / failed（启动阶段中止）。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::queue::LinkStatus;

/// 会话 ID
pub type SessionId = String;

/// 浏览上下文 ID（窗口或标签页）
pub type ContextId = u64;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Starting,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Completed | SessionStatus::Failed
        )
    }

    /// 状态图中是否存在 self → next 的边
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Created | Starting | Running | Paused, Stopped)
                | (Created | Starting | Running | Paused, Failed)
                | (Running | Paused, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话进度：total 为 jobsToApply，三个计数之和不超过 total
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    /// 当前正在处理的职位 URL
    pub current: Option<String>,
}

impl Progress {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// 已终结（成功 / 失败 / 跳过）的职位数
    pub fn resolved(&self) -> u32 {
        self.completed + self.failed + self.skipped
    }

    pub fn is_limit_reached(&self) -> bool {
        self.resolved() >= self.total
    }

    /// 记录一个职位的终结结果；到达上限后不再计数
    pub fn record(&mut self, status: LinkStatus) -> bool {
        if self.is_limit_reached() {
            return false;
        }
        match status {
            LinkStatus::Success => self.completed += 1,
            LinkStatus::Failed => self.failed += 1,
            LinkStatus::Skipped => self.skipped += 1,
        }
        true
    }
}
