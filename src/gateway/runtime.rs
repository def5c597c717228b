//! AutomationRuntime：把存储、编排器、路由、健康检查装配在一起
//!
//! start 之后后台常驻两个任务：MessageRouter 主循环与周期健康检查；
//! shutdown 先停止全部会话，再取消后台任务。

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::message::{ControlMessage, ControlResponse, Notification};
use super::port::PortRegistry;
use super::router::MessageRouter;
use super::session_store::{create_session_store, SessionStore};
use crate::config::AppConfig;
use crate::core::health::{HealthMonitor, HealthReport};
use crate::core::orchestrator::Orchestrator;
use crate::core::shutdown::{ShutdownManager, ShutdownReason};
use crate::platform::{BrowserDriver, PlatformAdapterFactory};

pub struct AutomationRuntime {
    orchestrator: Arc<Orchestrator>,
    router: Arc<MessageRouter>,
    health: Arc<HealthMonitor>,
    shutdown: ShutdownManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AutomationRuntime {
    /// 使用内存会话存储启动
    pub fn start(
        config: AppConfig,
        adapters: PlatformAdapterFactory,
        browser: Arc<dyn BrowserDriver>,
    ) -> Self {
        Self::start_with_store(config, adapters, browser, create_session_store())
    }

    pub fn start_with_store(
        config: AppConfig,
        adapters: PlatformAdapterFactory,
        browser: Arc<dyn BrowserDriver>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let config = Arc::new(config);
        let health = Arc::new(HealthMonitor::new(config.health.thresholds()));
        let (ports, inbound) = PortRegistry::new();
        let events = browser.subscribe();

        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            store,
            browser,
            adapters,
            health.clone(),
            Arc::new(ports),
        ));
        let router = Arc::new(MessageRouter::new(orchestrator.clone()));
        let shutdown = ShutdownManager::new();

        let router_task = tokio::spawn(router.clone().run(inbound, events, shutdown.token()));
        let health_task = health
            .clone()
            .spawn(config.health.check_interval(), shutdown.token());
        tracing::info!(
            platforms = ?config.app.supported_platforms,
            "automation runtime started"
        );

        Self {
            orchestrator,
            router,
            health,
            shutdown,
            tasks: Mutex::new(vec![router_task, health_task]),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn shutdown_manager(&self) -> &ShutdownManager {
        &self.shutdown
    }

    /// 控制面入口
    pub async fn handle(&self, message: ControlMessage) -> ControlResponse {
        self.router.handle_control(message).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.orchestrator.subscribe()
    }

    pub fn health_report(&self) -> HealthReport {
        self.health.report()
    }

    /// 停止全部会话并等待后台任务退出；可重复调用
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        self.shutdown.shutdown(ShutdownReason::Requested);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("background task ended abnormally: {}", e);
            }
        }
        tracing::info!("automation runtime stopped");
    }
}
