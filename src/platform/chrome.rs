//! headless_chrome 驱动
//!
//! 每个上下文对应一个 Tab；headless_chrome 是同步 API，所有调用都放进 spawn_blocking。
//! 浏览器在第一次 open_context 时才启动（需安装 Chrome/Chromium）。
//!
//! 限制：new_tab 总是开独立标签页，parent 只用于日志，父子关系由 SessionRegistry 记录；
//! 站点自行弹出的窗口不会以 Created 上报，因此这类弹窗不会继承会话。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, Tab};
use tokio::sync::broadcast;

use super::driver::{BrowserDriver, ContextEvent};
use crate::core::{AutomationError, ContextId};
use crate::gateway::message::SessionContext;

const EVENT_BUFFER: usize = 256;

/// 页面脚本读取会话上下文的全局变量
const CONTEXT_GLOBAL: &str = "__autoapplySession";

fn browser_error(e: impl std::fmt::Display) -> AutomationError {
    AutomationError::Browser(e.to_string())
}

pub struct ChromeDriver {
    browser: Arc<RwLock<Option<Browser>>>,
    tabs: Mutex<HashMap<ContextId, Arc<Tab>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<ContextEvent>,
}

impl ChromeDriver {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            browser: Arc::new(RwLock::new(None)),
            tabs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    fn tab(&self, context_id: ContextId) -> Result<Arc<Tab>, AutomationError> {
        self.tabs
            .lock()
            .map_err(browser_error)?
            .get(&context_id)
            .cloned()
            .ok_or_else(|| AutomationError::Browser(format!("context {context_id} is not open")))
    }

    async fn with_tab<T, F>(&self, context_id: ContextId, f: F) -> Result<T, AutomationError>
    where
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab(context_id)?;
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| AutomationError::Browser(format!("browser task failed: {e}")))?
            .map_err(browser_error)
    }

    fn emit(&self, event: ContextEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for ChromeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn open_context(&self, target: &str, parent: Option<ContextId>) -> Result<ContextId, AutomationError> {
        let browser_arc = Arc::clone(&self.browser);
        let url = target.to_string();
        let tab = tokio::task::spawn_blocking(move || -> anyhow::Result<Arc<Tab>> {
            let mut guard = browser_arc
                .write()
                .map_err(|e| anyhow::anyhow!("browser lock poisoned: {e}"))?;
            if guard.is_none() {
                *guard = Some(Browser::default()?);
            }
            let browser = guard
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("browser not started"))?;
            let tab = browser.new_tab()?;
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(tab)
        })
        .await
        .map_err(|e| AutomationError::Browser(format!("browser task failed: {e}")))?
        .map_err(browser_error)?;

        let context_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.tabs.lock().map_err(browser_error)?.insert(context_id, tab);
        tracing::debug!(context_id, ?parent, url = %target, "context opened");
        Ok(context_id)
    }

    async fn close_context(&self, context_id: ContextId) -> Result<(), AutomationError> {
        let tab = self
            .tabs
            .lock()
            .map_err(browser_error)?
            .remove(&context_id)
            .ok_or_else(|| AutomationError::Browser(format!("context {context_id} is not open")))?;
        tokio::task::spawn_blocking(move || tab.close(true))
            .await
            .map_err(|e| AutomationError::Browser(format!("browser task failed: {e}")))?
            .map_err(browser_error)?;
        self.emit(ContextEvent::Closed { context_id });
        Ok(())
    }

    async fn navigate(&self, context_id: ContextId, url: &str) -> Result<(), AutomationError> {
        let target = url.to_string();
        self.with_tab(context_id, move |tab| {
            tab.navigate_to(&target)?.wait_until_navigated()?;
            Ok(())
        })
        .await?;
        self.emit(ContextEvent::Navigated {
            context_id,
            url: url.to_string(),
        });
        Ok(())
    }

    async fn reload(&self, context_id: ContextId, ignore_cache: bool, timeout: Duration) -> Result<(), AutomationError> {
        let url = self
            .with_tab(context_id, move |tab| {
                tab.set_default_timeout(timeout);
                tab.reload(ignore_cache, None)?.wait_until_navigated()?;
                Ok(tab.get_url())
            })
            .await?;
        self.emit(ContextEvent::Navigated { context_id, url });
        Ok(())
    }

    async fn wait_for_element(&self, context_id: ContextId, selector: &str, timeout: Duration) -> Result<bool, AutomationError> {
        let selector = selector.to_string();
        self.with_tab(context_id, move |tab| {
            Ok(tab
                .wait_for_element_with_custom_timeout(&selector, timeout)
                .is_ok())
        })
        .await
    }

    async fn clear_form(&self, context_id: ContextId) -> Result<(), AutomationError> {
        self.with_tab(context_id, |tab| {
            tab.evaluate("document.querySelectorAll('form').forEach(f => f.reset())", false)?;
            Ok(())
        })
        .await
    }

    async fn inject_context(&self, context_id: ContextId, context: &SessionContext) -> Result<(), AutomationError> {
        let payload = serde_json::to_string(context).map_err(browser_error)?;
        let js = format!(
            "window.{CONTEXT_GLOBAL} = {payload}; window.dispatchEvent(new CustomEvent('autoapply:session'));"
        );
        self.with_tab(context_id, move |tab| {
            tab.evaluate(&js, false)?;
            Ok(())
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.events.subscribe()
    }
}
