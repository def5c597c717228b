//! 编排错误类型与恢复动作
//!
//! 与 ErrorRecoveryEngine 配合：适配器失败先被归类为 ErrorClass，再映射为 RecoveryAction
//! （reload_page / wait_for_element / clear_and_refill / refresh_page / generic_retry）。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::state::{ContextId, SessionStatus};

/// 编排层可能出现的错误（校验、重复请求、会话状态、浏览器、通道等）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AutomationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate request: {action} for user {user_id} on {platform} is already in flight")]
    DuplicateRequest {
        action: String,
        user_id: String,
        platform: String,
    },

    #[error("Session not running: {0}")]
    NotRunning(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    /// 平台不支持：对整个会话致命，不重试
    #[error("Platform unsupported: {0}")]
    PlatformUnsupported(String),

    /// 已投递过：不算失败，按 SKIPPED 处理
    #[error("Already applied: {0}")]
    DuplicateApplication(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// 同一上下文只能归属一个会话（先到先得）
    #[error("Context {context_id} is already bound to session {session_id}")]
    ContextConflict {
        context_id: ContextId,
        session_id: String,
    },

    #[error("Browser error: {0}")]
    Browser(String),

    /// 职位发现（find_jobs / load_more）失败，交给恢复引擎决定是否重试
    #[error("Job discovery failed during {operation}: {message}")]
    Discovery { operation: String, message: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl AutomationError {
    /// 控制面响应中的错误码
    pub fn code(&self) -> &'static str {
        match self {
            AutomationError::Validation(_) => "validation_error",
            AutomationError::DuplicateRequest { .. } => "duplicate_request",
            AutomationError::NotRunning(_) => "not_running",
            AutomationError::NotFound(_) => "not_found",
            AutomationError::PlatformUnsupported(_) => "platform_unsupported",
            AutomationError::DuplicateApplication(_) => "duplicate_application",
            AutomationError::Cancelled => "cancelled",
            AutomationError::InvalidTransition { .. } => "invalid_transition",
            AutomationError::ContextConflict { .. } => "context_conflict",
            AutomationError::Browser(_) => "browser_error",
            AutomationError::Discovery { .. } => "discovery_error",
            AutomationError::ChannelClosed(_) => "channel_closed",
            AutomationError::Timeout(_) => "timeout",
        }
    }

    /// 是否终止整个会话（其余错误只影响单个职位）
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            AutomationError::PlatformUnsupported(_) | AutomationError::Validation(_)
        )
    }
}

/// 失败分类（关键词 + 上下文启发式）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    Network,
    ElementNotFound,
    Form,
    Timeout,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::ElementNotFound => "elementNotFound",
            ErrorClass::Form => "form",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 恢复引擎针对某类错误给出的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// 重新加载页面（网络错误）
    ReloadPage,
    /// 等待目标元素出现
    WaitForElement,
    /// 清空表单后重新填写
    ClearAndRefill,
    /// 强制刷新（忽略缓存，超时后使用）
    RefreshPage,
    GenericRetry,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::ReloadPage => "reload_page",
            RecoveryAction::WaitForElement => "wait_for_element",
            RecoveryAction::ClearAndRefill => "clear_and_refill",
            RecoveryAction::RefreshPage => "refresh_page",
            RecoveryAction::GenericRetry => "generic_retry",
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
