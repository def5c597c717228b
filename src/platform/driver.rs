//! 浏览器驱动边界
//!
//! 编排层需要的浏览器能力：打开 / 关闭上下文、重载、等待元素、清空表单、注入会话上下文，
//! 以及上下文生命周期事件（创建、导航完成、关闭、DOM 显著变化）的订阅。

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::core::{AutomationError, ContextId};
use crate::gateway::message::SessionContext;

/// 浏览上下文生命周期事件，由驱动广播给 MessageRouter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// 新上下文；parent 为打开它的上下文（弹窗、新标签页）
    Created {
        context_id: ContextId,
        parent: Option<ContextId>,
        url: String,
    },
    /// 导航完成
    Navigated { context_id: ContextId, url: String },
    Closed { context_id: ContextId },
    DomSignificantChange { context_id: ContextId },
}

impl ContextEvent {
    pub fn context_id(&self) -> ContextId {
        match self {
            ContextEvent::Created { context_id, .. }
            | ContextEvent::Navigated { context_id, .. }
            | ContextEvent::Closed { context_id }
            | ContextEvent::DomSignificantChange { context_id } => *context_id,
        }
    }
}

/// 浏览器驱动：所有等待都必须有上限
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// 在 target 处打开新上下文；parent 为空时新开窗口
    async fn open_context(
        &self,
        target: &str,
        parent: Option<ContextId>,
    ) -> Result<ContextId, AutomationError>;

    async fn close_context(&self, context_id: ContextId) -> Result<(), AutomationError>;

    async fn navigate(&self, context_id: ContextId, url: &str) -> Result<(), AutomationError>;

    /// 重新加载；ignore_cache 为 true 时强制刷新
    async fn reload(
        &self,
        context_id: ContextId,
        ignore_cache: bool,
        timeout: Duration,
    ) -> Result<(), AutomationError>;

    /// 等待元素出现；超时返回 Ok(false)
    async fn wait_for_element(
        &self,
        context_id: ContextId,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, AutomationError>;

    async fn clear_form(&self, context_id: ContextId) -> Result<(), AutomationError>;

    /// 将会话上下文写入页面（供页面内脚本读取）
    async fn inject_context(
        &self,
        context_id: ContextId,
        context: &SessionContext,
    ) -> Result<(), AutomationError>;

    fn subscribe(&self) -> broadcast::Receiver<ContextEvent>;
}
