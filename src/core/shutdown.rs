//! 优雅关闭
//!
//! 统一的关闭信号：Ctrl+C / SIGTERM / 调用方主动触发都走同一个 CancellationToken。
//! 收到信号后先停止所有会话（STOP 下发、上下文释放），再让路由与健康检查任务退出。

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 调用方主动关闭
    Requested,
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Signal,
    /// 致命错误
    FatalError(String),
}

impl ShutdownReason {
    pub fn as_str(&self) -> &str {
        match self {
            ShutdownReason::Requested => "requested",
            ShutdownReason::Interrupt => "interrupt",
            ShutdownReason::Signal => "signal",
            ShutdownReason::FatalError(msg) => msg,
        }
    }
}

/// 关闭信号管理器；只记录第一次触发的原因
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            token: CancellationToken::new(),
            reason_tx,
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// 后台任务监听的 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复调用只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut current) = self.reason.lock() {
            if current.is_some() {
                return;
            }
            *current = Some(reason.clone());
        }
        tracing::info!(reason = reason.as_str(), "shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行直到 app 结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(manager: ShutdownManager, app: F, cleanup: impl FnOnce() -> Fut)
where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}
