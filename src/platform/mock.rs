//! 脚本化适配器与内存浏览器（用于测试与演示，无需真实浏览器）
//!
//! ScriptedAdapter 按预设分页返回职位，按 URL 脚本返回投递结果；
//! InMemoryBrowser 分配上下文 ID、记录驱动调用，并可模拟外部事件（关闭窗口、弹窗、导航）。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{broadcast, watch};

use crate::core::{AutomationError, ContextId, SessionId};
use crate::gateway::message::SessionContext;
use crate::gateway::session::SessionConfig;
use crate::platform::{AdapterError, ApplyOutcome, BrowserDriver, ContextEvent, PlatformAdapter};
use crate::queue::{JobCandidate, JobQueueItem};

/// 生成一页职位：`https://jobs.example.com/{prefix}/{i}`
pub fn job_page(prefix: &str, range: std::ops::Range<usize>) -> Vec<JobCandidate> {
    range
        .map(|i| {
            JobCandidate::new(
                format!("https://jobs.example.com/{prefix}/{i}"),
                format!("Job {i}"),
            )
            .with_company("Example Corp")
        })
        .collect()
}

type ApplyScript = VecDeque<Result<ApplyOutcome, AdapterError>>;

/// 脚本化适配器
pub struct ScriptedAdapter {
    platform: String,
    current: Mutex<Vec<JobCandidate>>,
    pages: Mutex<VecDeque<Vec<JobCandidate>>>,
    scripts: Mutex<HashMap<String, ApplyScript>>,
    load_more_script: Mutex<VecDeque<Result<(), AdapterError>>>,
    start_error: Mutex<Option<AdapterError>>,
    apply_delay: Duration,
    calls: Mutex<Vec<String>>,
    applied: Mutex<Vec<String>>,
    context: Mutex<Option<SessionContext>>,
}

impl ScriptedAdapter {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            current: Mutex::new(Vec::new()),
            pages: Mutex::new(VecDeque::new()),
            scripts: Mutex::new(HashMap::new()),
            load_more_script: Mutex::new(VecDeque::new()),
            start_error: Mutex::new(None),
            apply_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            context: Mutex::new(None),
        }
    }

    /// 第一页为当前页面，其余由 load_more 依次翻出
    pub fn with_pages(self, pages: Vec<Vec<JobCandidate>>) -> Self {
        let mut pages: VecDeque<_> = pages.into();
        if let Ok(mut current) = self.current.lock() {
            *current = pages.pop_front().unwrap_or_default();
        }
        if let Ok(mut rest) = self.pages.lock() {
            *rest = pages;
        }
        self
    }

    /// 为某个 URL 预设依次返回的投递结果；脚本用完后默认成功
    pub fn with_apply_results(
        self,
        url: impl Into<String>,
        results: Vec<Result<ApplyOutcome, AdapterError>>,
    ) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(url.into(), results.into());
        }
        self
    }

    /// 预设 load_more 依次返回的失败；Ok 表示这一次正常翻页
    pub fn with_load_more_results(self, results: Vec<Result<(), AdapterError>>) -> Self {
        if let Ok(mut script) = self.load_more_script.lock() {
            *script = results.into();
        }
        self
    }

    pub fn with_start_error(self, err: AdapterError) -> Self {
        if let Ok(mut slot) = self.start_error.lock() {
            *slot = Some(err);
        }
        self
    }

    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = delay;
        self
    }

    /// 依次调用过的方法名
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// apply 收到的 URL（含重试）
    pub fn applied_urls(&self) -> Vec<String> {
        self.applied.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn session_context(&self) -> Option<SessionContext> {
        self.context.lock().ok().and_then(|c| c.clone())
    }

    fn record(&self, call: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.to_string());
        }
    }
}

#[async_trait]
impl PlatformAdapter for ScriptedAdapter {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        self.record("initialize");
        Ok(())
    }

    async fn set_session_context(&self, context: &SessionContext) -> Result<(), AdapterError> {
        self.record("set_session_context");
        if let Ok(mut slot) = self.context.lock() {
            *slot = Some(context.clone());
        }
        Ok(())
    }

    async fn start(&self, _config: &SessionConfig) -> Result<(), AdapterError> {
        self.record("start");
        match self.start_error.lock().ok().and_then(|mut e| e.take()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn pause(&self) -> Result<(), AdapterError> {
        self.record("pause");
        Ok(())
    }

    async fn resume(&self) -> Result<(), AdapterError> {
        self.record("resume");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.record("stop");
        Ok(())
    }

    async fn find_jobs(&self) -> Result<Vec<JobCandidate>, AdapterError> {
        self.record("find_jobs");
        self.current
            .lock()
            .map(|c| c.clone())
            .map_err(|e| AdapterError::failed(e.to_string()))
    }

    async fn load_more(&self) -> Result<bool, AdapterError> {
        self.record("load_more");
        let scripted = self.load_more_script.lock().ok().and_then(|mut s| s.pop_front());
        if let Some(Err(err)) = scripted {
            return Err(err);
        }
        let next = self
            .pages
            .lock()
            .map_err(|e| AdapterError::failed(e.to_string()))?
            .pop_front();
        match next {
            Some(page) => {
                let mut current = self
                    .current
                    .lock()
                    .map_err(|e| AdapterError::failed(e.to_string()))?;
                // 无限滚动：新页追加到可见列表之后
                current.extend(page);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn apply(&self, job: &JobQueueItem) -> Result<ApplyOutcome, AdapterError> {
        if let Ok(mut applied) = self.applied.lock() {
            applied.push(job.url.clone());
        }
        if !self.apply_delay.is_zero() {
            tokio::time::sleep(self.apply_delay).await;
        }
        let scripted = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(&job.url).and_then(|q| q.pop_front()));
        scripted.unwrap_or_else(|| {
            Ok(ApplyOutcome::Submitted {
                application: json!({ "url": job.url, "title": job.title }),
            })
        })
    }

    fn is_application_page(&self, url: &str) -> bool {
        url.contains("/apply")
    }

    async fn on_dom_change(&self) {
        self.record("on_dom_change");
    }

    async fn on_navigation(&self, _old_url: Option<&str>, _new_url: &str) {
        self.record("on_navigation");
    }
}

/// 内存浏览器记录的调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Open {
        target: String,
        parent: Option<ContextId>,
    },
    Close(ContextId),
    Navigate(ContextId, String),
    Reload {
        context_id: ContextId,
        ignore_cache: bool,
    },
    WaitForElement(ContextId, String),
    ClearForm(ContextId),
    Inject(ContextId, SessionId),
}

#[derive(Debug, Clone)]
struct MemoryContext {
    parent: Option<ContextId>,
    url: String,
}

/// 内存浏览器
///
/// open_context 打开的上下文不广播 Created（调用方已拿到 ID）；
/// 页面自行打开的上下文用 [`InMemoryBrowser::open_popup`] 模拟。
pub struct InMemoryBrowser {
    next_id: AtomicU64,
    events: broadcast::Sender<ContextEvent>,
    contexts: Mutex<HashMap<ContextId, MemoryContext>>,
    calls: Mutex<Vec<DriverCall>>,
    /// true 时 open_context 挂起，直到 release_opens
    opens_paused: watch::Sender<bool>,
    fail_opens: AtomicBool,
    elements_present: AtomicBool,
}

impl InMemoryBrowser {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        let (opens_paused, _) = watch::channel(false);
        Self {
            next_id: AtomicU64::new(1),
            events,
            contexts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            opens_paused,
            fail_opens: AtomicBool::new(false),
            elements_present: AtomicBool::new(true),
        }
    }

    pub fn pause_opens(&self) {
        self.opens_paused.send_replace(true);
    }

    pub fn release_opens(&self) {
        self.opens_paused.send_replace(false);
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    pub fn set_elements_present(&self, present: bool) {
        self.elements_present.store(present, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// 注入到某上下文的会话 ID（按时间顺序）
    pub fn injections(&self, context_id: ContextId) -> Vec<SessionId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::Inject(id, session) if id == context_id => Some(session),
                _ => None,
            })
            .collect()
    }

    pub fn is_open(&self, context_id: ContextId) -> bool {
        self.contexts
            .lock()
            .map(|c| c.contains_key(&context_id))
            .unwrap_or(false)
    }

    /// 模拟页面打开弹窗 / 新标签页
    pub fn open_popup(&self, parent: ContextId, url: &str) -> ContextId {
        let id = self.allocate(url, Some(parent));
        self.emit(ContextEvent::Created {
            context_id: id,
            parent: Some(parent),
            url: url.to_string(),
        });
        id
    }

    /// 模拟用户在页面内导航
    pub fn navigate_externally(&self, context_id: ContextId, url: &str) {
        if let Ok(mut contexts) = self.contexts.lock() {
            if let Some(ctx) = contexts.get_mut(&context_id) {
                ctx.url = url.to_string();
            }
        }
        self.emit(ContextEvent::Navigated {
            context_id,
            url: url.to_string(),
        });
    }

    pub fn dom_change(&self, context_id: ContextId) {
        self.emit(ContextEvent::DomSignificantChange { context_id });
    }

    /// 模拟用户关闭窗口：该上下文及其所有子上下文依次关闭
    pub fn close_externally(&self, context_id: ContextId) {
        for id in self.remove_tree(context_id) {
            self.emit(ContextEvent::Closed { context_id: id });
        }
    }

    fn allocate(&self, url: &str, parent: Option<ContextId>) -> ContextId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut contexts) = self.contexts.lock() {
            contexts.insert(
                id,
                MemoryContext {
                    parent,
                    url: url.to_string(),
                },
            );
        }
        id
    }

    /// 删除以 root 为根的子树，返回删除顺序（根在前）
    fn remove_tree(&self, root: ContextId) -> Vec<ContextId> {
        let Ok(mut contexts) = self.contexts.lock() else {
            return Vec::new();
        };
        if !contexts.contains_key(&root) {
            return Vec::new();
        }
        let mut removed = vec![root];
        let mut cursor = 0;
        while cursor < removed.len() {
            let current = removed[cursor];
            let mut children: Vec<ContextId> = contexts
                .iter()
                .filter(|(_, ctx)| ctx.parent == Some(current))
                .map(|(id, _)| *id)
                .collect();
            children.sort_unstable();
            removed.extend(children);
            cursor += 1;
        }
        for id in &removed {
            contexts.remove(id);
        }
        removed
    }

    fn record(&self, call: DriverCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn emit(&self, event: ContextEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(&self, context_id: ContextId) -> Result<(), AutomationError> {
        if self.is_open(context_id) {
            Ok(())
        } else {
            Err(AutomationError::Browser(format!(
                "context {context_id} is closed"
            )))
        }
    }
}

impl Default for InMemoryBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserDriver for InMemoryBrowser {
    async fn open_context(
        &self,
        target: &str,
        parent: Option<ContextId>,
    ) -> Result<ContextId, AutomationError> {
        self.record(DriverCall::Open {
            target: target.to_string(),
            parent,
        });
        let mut gate = self.opens_paused.subscribe();
        gate.wait_for(|paused| !*paused)
            .await
            .map_err(|e| AutomationError::Browser(e.to_string()))?;
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(AutomationError::Browser("window creation refused".into()));
        }
        Ok(self.allocate(target, parent))
    }

    async fn close_context(&self, context_id: ContextId) -> Result<(), AutomationError> {
        self.record(DriverCall::Close(context_id));
        for id in self.remove_tree(context_id) {
            self.emit(ContextEvent::Closed { context_id: id });
        }
        Ok(())
    }

    async fn navigate(&self, context_id: ContextId, url: &str) -> Result<(), AutomationError> {
        self.record(DriverCall::Navigate(context_id, url.to_string()));
        self.ensure_open(context_id)?;
        self.navigate_externally(context_id, url);
        Ok(())
    }

    async fn reload(
        &self,
        context_id: ContextId,
        ignore_cache: bool,
        _timeout: Duration,
    ) -> Result<(), AutomationError> {
        self.record(DriverCall::Reload {
            context_id,
            ignore_cache,
        });
        self.ensure_open(context_id)
    }

    async fn wait_for_element(
        &self,
        context_id: ContextId,
        selector: &str,
        _timeout: Duration,
    ) -> Result<bool, AutomationError> {
        self.record(DriverCall::WaitForElement(context_id, selector.to_string()));
        self.ensure_open(context_id)?;
        Ok(self.elements_present.load(Ordering::SeqCst))
    }

    async fn clear_form(&self, context_id: ContextId) -> Result<(), AutomationError> {
        self.record(DriverCall::ClearForm(context_id));
        self.ensure_open(context_id)
    }

    async fn inject_context(
        &self,
        context_id: ContextId,
        context: &SessionContext,
    ) -> Result<(), AutomationError> {
        self.record(DriverCall::Inject(context_id, context.session_id.clone()));
        self.ensure_open(context_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.events.subscribe()
    }
}
