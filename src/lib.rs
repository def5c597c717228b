//! AutoApply - 多会话求职投递编排器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、会话状态机、会话监管、健康检查、编排器与 worker
//! - **gateway**: 消息协议、会话存储、PortChannel、会话注册表、消息路由与运行时装配
//! - **platform**: PlatformAdapter / BrowserDriver 边界、搜索偏好映射、测试替身
//! - **queue**: 按会话去重的职位队列
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod gateway;
pub mod observability;
pub mod platform;
pub mod queue;

pub use crate::config::{load_config, AppConfig};
pub use crate::core::{AutomationError, Orchestrator, SessionStatus, StartParams};
pub use crate::gateway::AutomationRuntime;
