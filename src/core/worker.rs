//! 会话 worker：在浏览上下文一侧驱动投递循环
//!
//! 通过自己的 PortChannel 与控制端对话：领取搜索任务 → 建队列 → 逐个 START_APPLICATION →
//! apply（失败时经 ErrorRecoveryEngine 重试）→ 回报结果 → 等 SEARCH_NEXT，直到达到上限或职位耗尽。
//! 单个职位的失败不会中断会话；平台不支持等致命错误以 fatal ERROR 回报后退出。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::AppConfig;
use crate::core::recovery::ErrorContext;
use crate::core::AutomationError;
use crate::gateway::message::{JobReport, PortMessage, PortMessageType, SearchTaskData};
use crate::gateway::port::{PortSender, WorkerPort};
use crate::gateway::registry::AutomationSession;
use crate::platform::{AdapterError, ApplyOutcome};
use crate::queue::{CompletionReason, DispatchError, JobDispatcher, JobQueueEngine, JobQueueItem, LinkStatus, QueueStep};

/// worker 参数
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub reply_timeout: Duration,
    pub apply_timeout: Duration,
    pub buffer_threshold: usize,
    pub max_empty_pages: u32,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            reply_timeout: Duration::from_secs(config.router.port_reply_timeout_secs),
            apply_timeout: Duration::from_secs(config.worker.apply_timeout_secs),
            buffer_threshold: config.queue.buffer_threshold,
            max_empty_pages: config.queue.max_empty_pages,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// worker 退出方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Completed(CompletionReason),
    /// 已以 fatal ERROR 回报
    Aborted,
}

/// 把队列派发转成 START_APPLICATION
struct PortDispatcher {
    sender: PortSender,
    session_id: String,
}

impl JobDispatcher for PortDispatcher {
    fn dispatch(&mut self, item: &JobQueueItem) -> Result<(), DispatchError> {
        let message = PortMessage::for_session(PortMessageType::StartApplication, self.session_id.clone())
            .with_payload(item);
        self.sender.post(message).map_err(|_| DispatchError::Disconnected)
    }
}

pub struct SessionWorker {
    session: Arc<AutomationSession>,
    port: WorkerPort,
    settings: WorkerSettings,
}

impl SessionWorker {
    pub fn new(session: Arc<AutomationSession>, port: WorkerPort, settings: WorkerSettings) -> Self {
        Self {
            session,
            port,
            settings,
        }
    }

    pub async fn run(mut self) {
        let session_id = self.session.id.clone();
        match self.drive().await {
            Ok(WorkerExit::Completed(reason)) => {
                tracing::info!(%session_id, reason = reason.as_str(), "worker finished queue");
            }
            Ok(WorkerExit::Aborted) => {
                tracing::warn!(%session_id, "worker aborted after fatal error");
            }
            Err(AutomationError::Cancelled)
            | Err(AutomationError::ChannelClosed(_))
            | Err(AutomationError::NotRunning(_)) => {
                tracing::debug!(%session_id, "worker stopped");
            }
            Err(e) => {
                tracing::error!(%session_id, "worker failed: {}", e);
                let report = JobReport::failed("", 0, e.to_string()).fatal();
                let _ = self.post(PortMessageType::Error, &report);
            }
        }
    }

    fn post<P: serde::Serialize>(&self, kind: PortMessageType, payload: &P) -> Result<(), AutomationError> {
        self.port
            .post(PortMessage::for_session(kind, self.session.id.clone()).with_payload(payload))
    }

    /// 控制端以 ERROR 回复：会话已不在运行
    fn refused(&self, reply: &PortMessage) -> AutomationError {
        let detail = reply
            .payload
            .get("error")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("request refused");
        tracing::debug!(session_id = %self.session.id, "controller refused: {}", detail);
        AutomationError::NotRunning(self.session.id.clone())
    }

    async fn drive(&mut self) -> Result<WorkerExit, AutomationError> {
        let adapter = self.session.adapter.clone();
        adapter.initialize().await?;
        adapter.set_session_context(&self.session.context).await?;

        self.post(PortMessageType::GetSearchTask, &serde_json::Value::Null)?;
        let reply = self
            .await_reply(&[PortMessageType::SearchTaskData, PortMessageType::Error])
            .await?;
        if reply.kind == PortMessageType::Error {
            return Err(self.refused(&reply));
        }
        let task: SearchTaskData = reply.payload_as()?;

        if let Err(e) = adapter.start(&self.session.config).await {
            if let AdapterError::Unsupported(message) = &e {
                let report = JobReport::failed("", 0, message.clone()).fatal();
                self.post(PortMessageType::Error, &report)?;
                return Ok(WorkerExit::Aborted);
            }
            return Err(e.into());
        }

        let mut engine = JobQueueEngine::new(adapter, task.limit, task.submitted)
            .with_buffer_threshold(self.settings.buffer_threshold)
            .with_max_empty_pages(self.settings.max_empty_pages);
        let queued = loop {
            self.checkpoint().await?;
            match engine.build_queue().await {
                Ok(added) => break added,
                Err(AutomationError::Discovery { operation, message }) => {
                    if !self.recover_discovery(&operation, &message).await? {
                        engine.mark_exhausted();
                        break 0;
                    }
                }
                Err(e) => return Err(e),
            }
        };
        tracing::info!(session_id = %self.session.id, queued, limit = task.limit, "queue built");

        let mut dispatcher = PortDispatcher {
            sender: self.port.sender(),
            session_id: self.session.id.clone(),
        };

        loop {
            self.checkpoint().await?;
            let step = match engine.process_next(&mut dispatcher).await {
                Ok(step) => step,
                Err(AutomationError::Discovery { operation, message }) => {
                    if !self.recover_discovery(&operation, &message).await? {
                        engine.mark_exhausted();
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            let item = match step {
                QueueStep::Dispatched(item) => item,
                QueueStep::Completed(reason) => {
                    self.post(
                        PortMessageType::SearchCompleted,
                        &serde_json::json!({ "reason": reason.as_str() }),
                    )?;
                    return Ok(WorkerExit::Completed(reason));
                }
            };

            let reply = self
                .await_reply(&[
                    PortMessageType::ApplicationTaskData,
                    PortMessageType::Duplicate,
                    PortMessageType::Error,
                ])
                .await;
            let report = match reply {
                Ok(message) if message.kind == PortMessageType::ApplicationTaskData => {
                    self.post(PortMessageType::ApplicationStarting, &serde_json::json!({ "url": item.url }))?;
                    self.apply_with_recovery(&item).await?
                }
                Ok(message) if message.kind == PortMessageType::Duplicate => JobReport::skipped(&item.url, 0),
                Ok(_) => JobReport::failed(&item.url, 0, "application rejected by controller"),
                Err(AutomationError::Timeout(message)) => JobReport::failed(&item.url, 0, message),
                Err(e) => return Err(e),
            };

            engine.record_outcome(&report.url, report.status, report.tries);
            let kind = match report.status {
                LinkStatus::Success => PortMessageType::ApplicationSuccess,
                LinkStatus::Skipped => PortMessageType::Duplicate,
                LinkStatus::Failed => PortMessageType::Error,
            };
            self.post(kind, &report)?;
            if report.fatal {
                return Ok(WorkerExit::Aborted);
            }

            match self
                .await_reply(&[PortMessageType::SearchNext, PortMessageType::Error])
                .await
            {
                Ok(reply) if reply.kind == PortMessageType::Error => return Err(self.refused(&reply)),
                Ok(_) => {}
                Err(AutomationError::Timeout(message)) => {
                    tracing::warn!(session_id = %self.session.id, "{}, moving on", message);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 单个职位：失败按分类重试，超过上限记为 FAILED；计数在职位之间清零
    async fn apply_with_recovery(&mut self, item: &JobQueueItem) -> Result<JobReport, AutomationError> {
        let session = self.session.clone();
        session.recovery.reset();
        let mut tries = 0;

        loop {
            self.checkpoint().await?;
            let attempt = tokio::select! {
                _ = session.supervisor.cancelled() => return Err(AutomationError::Cancelled),
                result = tokio::time::timeout(self.settings.apply_timeout, session.adapter.apply(item)) => result,
            };

            let (message, selector) = match attempt {
                Ok(Ok(ApplyOutcome::Submitted { application })) => {
                    return Ok(JobReport::success(&item.url, tries, application))
                }
                Ok(Ok(ApplyOutcome::AlreadyApplied)) => return Ok(JobReport::skipped(&item.url, tries)),
                Ok(Err(AdapterError::Unsupported(message))) => {
                    return Ok(JobReport::failed(&item.url, tries, message).fatal())
                }
                Ok(Err(AdapterError::Cancelled)) => return Err(AutomationError::Cancelled),
                Ok(Err(e)) => (e.to_string(), e.selector().map(str::to_string)),
                Err(_) => (
                    format!("apply timed out after {:?}", self.settings.apply_timeout),
                    None,
                ),
            };

            let ctx = ErrorContext::new(session.platform.clone(), "apply", session.context_id)
                .with_selector(selector.as_deref())
                .with_url(item.url.clone());
            let class = session.recovery.classify(&message, &ctx);
            self.post(
                PortMessageType::ApplicationStatus,
                &serde_json::json!({ "url": item.url, "error": message, "class": class }),
            )?;

            let Some(strategy) = session.recovery.next_strategy(class, &ctx) else {
                tracing::warn!(url = %item.url, %class, tries, "retries exhausted: {}", message);
                return Ok(JobReport::failed(&item.url, tries, message).with_class(class));
            };
            session.supervisor.sleep(strategy.delay).await?;
            let outcome = session.recovery.execute(&strategy, &ctx).await;
            if !outcome.success {
                let detail = outcome.detail.unwrap_or(message);
                return Ok(JobReport::failed(&item.url, tries, detail).with_class(class));
            }
            tries += 1;
        }
    }

    /// 翻页 / 提取失败：可恢复时执行恢复动作并返回 true，重试用尽返回 false
    async fn recover_discovery(&mut self, operation: &str, message: &str) -> Result<bool, AutomationError> {
        let session = self.session.clone();
        let ctx = ErrorContext::new(session.platform.clone(), operation, session.context_id);
        let class = session.recovery.classify(message, &ctx);
        let Some(strategy) = session.recovery.next_strategy(class, &ctx) else {
            tracing::warn!(session_id = %session.id, operation, %class, "discovery retries exhausted: {}", message);
            return Ok(false);
        };
        tracing::warn!(
            session_id = %session.id,
            operation,
            %class,
            action = %strategy.action,
            attempt = strategy.attempt,
            "discovery failed, recovering: {}",
            message
        );
        session.supervisor.sleep(strategy.delay).await?;
        let outcome = session.recovery.execute(&strategy, &ctx).await;
        if !outcome.success {
            tracing::debug!(session_id = %session.id, operation, "recovery action failed: {:?}", outcome.detail);
        }
        Ok(true)
    }

    /// 暂停时阻塞；等待期间照常处理 PAUSE / RESUME / STOP
    async fn checkpoint(&mut self) -> Result<(), AutomationError> {
        loop {
            tokio::select! {
                biased;
                result = self.session.supervisor.checkpoint() => return result,
                message = self.port.recv() => match message {
                    Some(message) => self.handle_signal(&message).await?,
                    None => {
                        return Err(AutomationError::ChannelClosed(format!(
                            "port {} disconnected",
                            self.port.name()
                        )))
                    }
                },
            }
        }
    }

    /// 等待指定类型的回复；其间收到的控制信号就地处理
    async fn await_reply(&mut self, expected: &[PortMessageType]) -> Result<PortMessage, AutomationError> {
        let deadline = Instant::now() + self.settings.reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = tokio::select! {
                _ = self.session.supervisor.cancelled() => return Err(AutomationError::Cancelled),
                message = self.port.recv_timeout(remaining) => message?,
            };
            if expected.contains(&message.kind) {
                return Ok(message);
            }
            self.handle_signal(&message).await?;
        }
    }

    async fn handle_signal(&self, message: &PortMessage) -> Result<(), AutomationError> {
        let adapter = &self.session.adapter;
        match message.kind {
            PortMessageType::Pause => {
                self.session.supervisor.set_paused(true);
                if let Err(e) = adapter.pause().await {
                    tracing::debug!(session_id = %self.session.id, "adapter pause failed: {}", e);
                }
            }
            PortMessageType::Resume => {
                self.session.supervisor.set_paused(false);
                if let Err(e) = adapter.resume().await {
                    tracing::debug!(session_id = %self.session.id, "adapter resume failed: {}", e);
                }
            }
            PortMessageType::Stop => {
                self.session.supervisor.cancel();
                return Err(AutomationError::Cancelled);
            }
            other => {
                tracing::debug!(session_id = %self.session.id, "ignoring {:?} while waiting", other);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::recovery::{ErrorRecoveryEngine, RecoveryPolicy};
    use crate::core::{ContextId, SessionStatus};
    use crate::gateway::message::{ApplicationTaskData, SessionContext};
    use crate::gateway::port::{Inbound, PortName, PortRegistry};
    use crate::gateway::session::SessionConfig;
    use crate::platform::mock::{job_page, DriverCall, InMemoryBrowser, ScriptedAdapter};
    use crate::platform::{BrowserDriver, PlatformAdapter};
    use tokio::sync::mpsc;

    struct Fixture {
        ports: PortRegistry,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        browser: Arc<InMemoryBrowser>,
        context_id: ContextId,
    }

    async fn spawn_worker(adapter: Arc<ScriptedAdapter>) -> Fixture {
        let browser = Arc::new(InMemoryBrowser::new());
        let context_id = browser.open_context("https://jobs.example.com/search", None).await.unwrap();
        let policy = RecoveryPolicy {
            network_base_delay: Duration::from_millis(5),
            network_step_delay: Duration::from_millis(5),
            unknown_delay: Duration::from_millis(5),
            ..RecoveryPolicy::default()
        };
        let context = SessionContext {
            session_id: "w1".into(),
            platform: "linkedin".into(),
            user_id: "u1".into(),
            user_profile: serde_json::Value::Null,
            session_config: SessionConfig::default(),
            api_host: String::new(),
            preferences: Default::default(),
        };
        let adapter: Arc<dyn PlatformAdapter> = adapter;
        let session = Arc::new(AutomationSession::new(
            context,
            context_id,
            adapter,
            Arc::new(ErrorRecoveryEngine::new(browser.clone(), policy)),
            SessionStatus::Starting,
        ));

        let (ports, inbound) = PortRegistry::new();
        let port = ports.connect(PortName::new("linkedin", context_id), "w1");
        let settings = WorkerSettings {
            reply_timeout: Duration::from_secs(5),
            apply_timeout: Duration::from_secs(5),
            ..WorkerSettings::default()
        };
        tokio::spawn(SessionWorker::new(session, port, settings).run());
        Fixture {
            ports,
            inbound,
            browser,
            context_id,
        }
    }

    /// 扮演控制端：按协议回复，直到 SEARCH_COMPLETED 或 fatal ERROR
    async fn serve(fixture: &mut Fixture, limit: u32) -> Vec<PortMessage> {
        let mut seen = Vec::new();
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), fixture.inbound.recv()).await;
            let Ok(Some(Inbound { message, .. })) = next else {
                return seen;
            };
            let fatal = message.payload.get("fatal").and_then(serde_json::Value::as_bool) == Some(true);
            let reply = match message.kind {
                PortMessageType::GetSearchTask => Some(
                    PortMessage::for_session(PortMessageType::SearchTaskData, "w1")
                        .with_payload(&SearchTaskData {
                            limit,
                            ..SearchTaskData::default()
                        }),
                ),
                PortMessageType::StartApplication => Some(
                    PortMessage::for_session(PortMessageType::ApplicationTaskData, "w1").with_payload(
                        &ApplicationTaskData {
                            job: None,
                            user_profile: serde_json::Value::Null,
                            api_host: String::new(),
                        },
                    ),
                ),
                PortMessageType::ApplicationSuccess | PortMessageType::Duplicate => {
                    Some(PortMessage::for_session(PortMessageType::SearchNext, "w1"))
                }
                PortMessageType::Error if !fatal => {
                    Some(PortMessage::for_session(PortMessageType::SearchNext, "w1"))
                }
                _ => None,
            };
            let done = message.kind == PortMessageType::SearchCompleted || fatal;
            seen.push(message);
            if let Some(reply) = reply {
                fixture.ports.send(fixture.context_id, reply).unwrap();
            }
            if done {
                return seen;
            }
        }
    }

    fn kinds(messages: &[PortMessage]) -> Vec<PortMessageType> {
        messages.iter().map(|m| m.kind).collect()
    }

    fn network_failure() -> Result<(), AdapterError> {
        Err(AdapterError::failed("net::ERR_CONNECTION_RESET network error"))
    }

    #[tokio::test]
    async fn test_load_more_failure_is_recovered() {
        let adapter = Arc::new(
            ScriptedAdapter::new("linkedin")
                .with_pages(vec![job_page("w", 0..2)])
                .with_load_more_results(vec![network_failure()]),
        );
        let mut fixture = spawn_worker(adapter.clone()).await;
        let messages = serve(&mut fixture, 2).await;

        let last = messages.last().unwrap();
        assert_eq!(last.kind, PortMessageType::SearchCompleted);
        assert_eq!(last.payload["reason"], "limit reached");
        assert_eq!(
            kinds(&messages)
                .iter()
                .filter(|k| **k == PortMessageType::ApplicationSuccess)
                .count(),
            2
        );
        assert!(adapter.calls().iter().filter(|c| *c == "load_more").count() >= 2);
        assert!(fixture.browser.calls().contains(&DriverCall::Reload {
            context_id: fixture.context_id,
            ignore_cache: false,
        }));
    }

    #[tokio::test]
    async fn test_pagination_abandoned_after_retries() {
        let adapter = Arc::new(
            ScriptedAdapter::new("linkedin")
                .with_pages(vec![job_page("w", 0..1), job_page("w", 1..2)])
                .with_load_more_results((0..4).map(|_| network_failure()).collect()),
        );
        let mut fixture = spawn_worker(adapter.clone()).await;
        let messages = serve(&mut fixture, 5).await;

        let last = messages.last().unwrap();
        assert_eq!(last.kind, PortMessageType::SearchCompleted);
        assert_eq!(last.payload["reason"], "queue exhausted");
        // 第一页的职位照常投递，第二页永远没有翻出来
        assert_eq!(adapter.applied_urls(), vec!["https://jobs.example.com/w/0".to_string()]);
        assert!(!messages.iter().any(|m| m.kind == PortMessageType::Error));
    }

    #[tokio::test]
    async fn test_unsupported_start_reports_fatal_error() {
        let adapter = Arc::new(
            ScriptedAdapter::new("linkedin")
                .with_pages(vec![job_page("w", 0..2)])
                .with_start_error(AdapterError::Unsupported("captcha wall".into())),
        );
        let mut fixture = spawn_worker(adapter.clone()).await;
        let messages = serve(&mut fixture, 2).await;

        let last = messages.last().unwrap();
        assert_eq!(last.kind, PortMessageType::Error);
        assert_eq!(last.payload["fatal"], true);
        assert_eq!(last.payload["error"], "captcha wall");
        assert!(adapter.applied_urls().is_empty());
    }

    #[tokio::test]
    async fn test_already_applied_reported_as_duplicate() {
        let adapter = Arc::new(
            ScriptedAdapter::new("linkedin")
                .with_pages(vec![job_page("w", 0..2)])
                .with_apply_results("https://jobs.example.com/w/0", vec![Ok(ApplyOutcome::AlreadyApplied)]),
        );
        let mut fixture = spawn_worker(adapter).await;
        let messages = serve(&mut fixture, 2).await;

        let duplicate = messages
            .iter()
            .find(|m| m.kind == PortMessageType::Duplicate)
            .unwrap();
        assert_eq!(duplicate.payload["url"], "https://jobs.example.com/w/0");
        assert_eq!(duplicate.payload["status"], "SKIPPED");
        assert_eq!(messages.last().unwrap().kind, PortMessageType::SearchCompleted);
    }
}
