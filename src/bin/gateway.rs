//! AutoApply Gateway - WebSocket 控制面服务器
//!
//! 对外接收 startApplying / pauseApplying / getStatus ... 请求，并推送会话通知。
//! 开启 `browser` feature 时使用 headless_chrome，否则使用内存浏览器联调。
//!
//! 运行方式：
//! ```bash
//! cargo run --bin autoapply-gateway --features gateway
//! cargo run --bin autoapply-gateway --features "gateway browser" -- config/prod.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use autoapply::config::load_config;
use autoapply::core::shutdown::run_with_graceful_shutdown;
use autoapply::gateway::ControlServer;
use autoapply::platform::mock::{job_page, ScriptedAdapter};
use autoapply::platform::{BrowserDriver, PlatformAdapter, PlatformAdapterFactory};
use autoapply::{observability, AutomationRuntime};

#[cfg(feature = "browser")]
fn browser() -> Arc<dyn BrowserDriver> {
    Arc::new(autoapply::platform::chrome::ChromeDriver::new())
}

#[cfg(not(feature = "browser"))]
fn browser() -> Arc<dyn BrowserDriver> {
    Arc::new(autoapply::platform::mock::InMemoryBrowser::new())
}

/// 联调用适配器：每个平台两页脚本化职位
fn adapters(platforms: &[String]) -> PlatformAdapterFactory {
    let mut factory = PlatformAdapterFactory::new();
    for platform in platforms {
        let name = platform.clone();
        factory.register(platform.clone(), move || -> Arc<dyn PlatformAdapter> {
            Arc::new(
                ScriptedAdapter::new(name.clone())
                    .with_pages(vec![job_page(&name, 0..10), job_page(&name, 10..20)]),
            )
        });
    }
    factory
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path)?;
    let gateway_config = cfg.gateway.clone();
    let factory = adapters(&cfg.app.supported_platforms);

    let runtime = Arc::new(AutomationRuntime::start(cfg, factory, browser()));
    let server = ControlServer::new(gateway_config.clone(), runtime.router().clone());
    let manager = runtime.shutdown_manager().clone();
    let token = manager.token();

    tracing::info!("Starting AutoApply gateway on ws://{}", gateway_config.bind_addr);
    tracing::info!("Press Ctrl+C to stop");

    let cleanup_runtime = runtime.clone();
    run_with_graceful_shutdown(
        manager,
        async move {
            if let Err(e) = server.serve(token).await {
                tracing::error!("gateway server failed: {:#}", e);
            }
        },
        move || async move {
            tracing::info!("Shutting down gateway...");
            cleanup_runtime.shutdown().await;
        },
    )
    .await;

    Ok(())
}
