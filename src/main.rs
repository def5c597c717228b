//! AutoApply 演示程序
//!
//! 用脚本化适配器与内存浏览器跑两个并发会话（linkedin / indeed），
//! 打印每条会话通知，结束后输出会话状态与健康报告。
//!
//! ```bash
//! cargo run -- config/default.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use autoapply::config::load_config;
use autoapply::gateway::{ControlAction, ControlMessage, Notification};
use autoapply::platform::mock::{job_page, InMemoryBrowser, ScriptedAdapter};
use autoapply::platform::{AdapterError, ApplyOutcome, PlatformAdapter, PlatformAdapterFactory};
use autoapply::{observability, AppConfig, AutomationRuntime};
use serde_json::json;

fn demo_adapters() -> PlatformAdapterFactory {
    let mut adapters = PlatformAdapterFactory::new();
    adapters.register("linkedin", || -> Arc<dyn PlatformAdapter> {
        Arc::new(
            ScriptedAdapter::new("linkedin")
                .with_pages(vec![job_page("li", 0..4), job_page("li", 4..8)])
                .with_apply_results(
                    "https://jobs.example.com/li/1",
                    vec![Err(AdapterError::element("#submit-application", "element not found"))],
                )
                .with_apply_results(
                    "https://jobs.example.com/li/2",
                    vec![Ok(ApplyOutcome::AlreadyApplied)],
                ),
        )
    });
    adapters.register("indeed", || -> Arc<dyn PlatformAdapter> {
        Arc::new(ScriptedAdapter::new("indeed").with_pages(vec![job_page("in", 0..3)]))
    });
    adapters
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let runtime = AutomationRuntime::start(cfg, demo_adapters(), Arc::new(InMemoryBrowser::new()));
    let mut notifications = runtime.subscribe();

    let mut pending = Vec::new();
    for (platform, jobs) in [("linkedin", 5), ("indeed", 5)] {
        let request = ControlMessage::new(ControlAction::StartApplying).with_payload(&json!({
            "platform": platform,
            "userId": "demo-user",
            "jobsToApply": jobs,
            "preferences": {"positions": ["Rust Engineer"], "remoteOnly": true},
        }));
        let response = runtime.handle(request).await;
        let session_id = response
            .session_id
            .clone()
            .with_context(|| format!("{platform} session did not start: {:?}", response.error))?;
        println!("started {platform}: {session_id} (context {:?})", response.context_id);
        pending.push(session_id);
    }

    while !pending.is_empty() {
        let notification = notifications.recv().await.context("notification stream closed")?;
        println!("{}", serde_json::to_string(&notification)?);
        if let Notification::SessionFinished { session_id, .. } = &notification {
            pending.retain(|id| id != session_id);
        }
    }

    for session in runtime.orchestrator().store().list(&Default::default()).await {
        println!(
            "{} {} {} -> {:?}",
            session.id, session.platform, session.status, session.progress
        );
    }
    println!("{}", serde_json::to_string_pretty(&runtime.health_report())?);

    runtime.shutdown().await;
    Ok(())
}
