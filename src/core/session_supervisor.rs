//! 会话监管：取消与暂停
//!
//! 每个自动化会话持有一个 SessionSupervisor，与其 worker 共享。stop 时触发取消令牌，
//! worker 在每个恢复点（下一个职位、重试等待、回复等待）之前检查并尽快退出。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::AutomationError;

/// 会话级生命周期管理：取消令牌与暂停状态
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    /// stop 时触发
    cancel_token: CancellationToken,
    /// 是否已暂停（watch 便于 worker 等待恢复）
    paused: Arc<watch::Sender<bool>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel_token: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    /// 恢复点：暂停时阻塞直到恢复；已取消则返回 Cancelled
    pub async fn checkpoint(&self) -> Result<(), AutomationError> {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel_token.is_cancelled() {
                return Err(AutomationError::Cancelled);
            }
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel_token.cancelled() => return Err(AutomationError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(AutomationError::Cancelled);
                    }
                }
            }
        }
    }

    /// 可被取消的延时（重试退避）
    pub async fn sleep(&self, delay: Duration) -> Result<(), AutomationError> {
        tokio::select! {
            _ = self.cancel_token.cancelled() => Err(AutomationError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
