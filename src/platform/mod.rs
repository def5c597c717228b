//! 平台边界：PlatformAdapter（每个招聘站点一个实现）与浏览器驱动
//!
//! 编排层只通过这两个 trait 与站点和浏览器交互；站点 DOM 选择器、表单填写细节都在适配器内部。
//! PlatformAdapterFactory 按平台名注册工厂，每个会话解析一次。

pub mod driver;
pub mod mock;
pub mod preferences;

#[cfg(feature = "browser")]
pub mod chrome;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::AutomationError;
use crate::gateway::message::SessionContext;
use crate::gateway::session::SessionConfig;
use crate::queue::{JobCandidate, JobQueueItem};

pub use driver::{BrowserDriver, ContextEvent};
pub use preferences::{build_search_target, JobPreferences};

/// 适配器失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// 当前页面 / 站点不被该适配器支持，对会话致命
    #[error("Platform unsupported: {0}")]
    Unsupported(String),

    /// 目标元素缺失（selector 供恢复引擎等待）
    #[error("Element not found: {selector}: {message}")]
    Element { selector: String, message: String },

    #[error("{0}")]
    Failed(String),

    #[error("Adapter cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn failed(message: impl Into<String>) -> Self {
        AdapterError::Failed(message.into())
    }

    pub fn element(selector: impl Into<String>, message: impl Into<String>) -> Self {
        AdapterError::Element {
            selector: selector.into(),
            message: message.into(),
        }
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            AdapterError::Element { selector, .. } => Some(selector),
            _ => None,
        }
    }
}

impl From<AdapterError> for AutomationError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Unsupported(msg) => AutomationError::PlatformUnsupported(msg),
            AdapterError::Cancelled => AutomationError::Cancelled,
            other => AutomationError::Browser(other.to_string()),
        }
    }
}

/// 单次投递的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// 表单已提交；application 为站点返回的投递信息
    Submitted { application: Value },
    /// 站点提示已投递过，按 SKIPPED 记录
    AlreadyApplied,
}

/// 招聘站点适配器：DOM 交互全部在实现内部
///
/// 方法均取 `&self`，实现自行用内部可变性保存页面状态。
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// 平台名（linkedin / indeed / ...）
    fn platform(&self) -> &str;

    async fn initialize(&self) -> Result<(), AdapterError>;

    /// 注入会话上下文（用户资料、偏好、api_host）
    async fn set_session_context(&self, context: &SessionContext) -> Result<(), AdapterError>;

    async fn start(&self, config: &SessionConfig) -> Result<(), AdapterError>;

    async fn pause(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// 提取当前页面可见的职位
    async fn find_jobs(&self) -> Result<Vec<JobCandidate>, AdapterError>;

    /// 翻页；返回 false 表示没有更多页
    async fn load_more(&self) -> Result<bool, AdapterError>;

    /// 打开职位并完成投递表单
    async fn apply(&self, job: &JobQueueItem) -> Result<ApplyOutcome, AdapterError>;

    fn is_application_page(&self, url: &str) -> bool;

    async fn on_dom_change(&self) {}

    async fn on_navigation(&self, _old_url: Option<&str>, _new_url: &str) {}
}

/// 适配器工厂
pub type AdapterFactory = Arc<dyn Fn() -> Arc<dyn PlatformAdapter> + Send + Sync>;

/// 平台名 → 适配器工厂
#[derive(Default, Clone)]
pub struct PlatformAdapterFactory {
    factories: HashMap<String, AdapterFactory>,
}

impl PlatformAdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, platform: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn PlatformAdapter> + Send + Sync + 'static,
    {
        self.factories.insert(platform.into(), Arc::new(factory));
    }

    /// 为新会话创建适配器实例
    pub fn create(&self, platform: &str) -> Result<Arc<dyn PlatformAdapter>, AutomationError> {
        let factory = self
            .factories
            .get(platform)
            .ok_or_else(|| AutomationError::PlatformUnsupported(platform.to_string()))?;
        Ok(factory())
    }

    pub fn supports(&self, platform: &str) -> bool {
        self.factories.contains_key(platform)
    }

    /// 已注册平台（排序）
    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for PlatformAdapterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformAdapterFactory")
            .field("platforms", &self.platforms())
            .finish()
    }
}
