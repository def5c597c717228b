//! 会话编排器：会话生命周期的唯一写入方
//!
//! 负责：校验启动参数、创建适配器与会话记录、打开并绑定浏览上下文、建立 PortChannel、
//! 启动 SessionWorker；暂停 / 恢复 / 停止 / 完成 / 失败时按状态图迁移，
//! 每次迁移同步写入 SessionStore 并广播一条 StatusChanged。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::health::HealthMonitor;
use crate::core::recovery::{self, ErrorContext, ErrorRecoveryEngine};
use crate::core::worker::{SessionWorker, WorkerSettings};
use crate::core::{AutomationError, ContextId, ErrorClass, Progress, SessionId, SessionStatus};
use crate::gateway::message::{
    ApplicationTaskData, JobReport, Notification, PortMessage, PortMessageType, SearchTaskData,
    SessionContext,
};
use crate::gateway::port::{PortName, PortRegistry};
use crate::gateway::registry::{AutomationSession, SessionRegistry};
use crate::gateway::session::{NewSession, Session, SessionConfig, SessionErrorRecord, SessionPatch};
use crate::gateway::session_store::SessionStore;
use crate::platform::{build_search_target, BrowserDriver, JobPreferences, PlatformAdapterFactory};
use crate::queue::{JobQueueItem, LinkStatus, SubmittedLink};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// startApplying 的载荷
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartParams {
    pub platform: String,
    pub user_id: String,
    pub jobs_to_apply: i64,
    pub preferences: JobPreferences,
    pub user_profile: Value,
    pub api_host: String,
    /// 在已有窗口内开标签页；为空时新开窗口
    pub window: Option<ContextId>,
}

impl StartParams {
    fn validate(&self) -> Result<u32, AutomationError> {
        if self.platform.trim().is_empty() {
            return Err(AutomationError::Validation("platform is required".into()));
        }
        if self.user_id.trim().is_empty() {
            return Err(AutomationError::Validation("userId is required".into()));
        }
        if self.jobs_to_apply <= 0 {
            return Err(AutomationError::Validation(
                "jobsToApply must be a positive integer".into(),
            ));
        }
        u32::try_from(self.jobs_to_apply)
            .map_err(|_| AutomationError::Validation("jobsToApply is too large".into()))
    }
}

/// 启动结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedSession {
    pub session_id: SessionId,
    pub context_id: ContextId,
}

/// START_APPLICATION 的裁决
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchDecision {
    Apply(ApplicationTaskData),
    Duplicate,
}

/// 会话编排器
pub struct Orchestrator {
    config: Arc<AppConfig>,
    store: Arc<dyn SessionStore>,
    browser: Arc<dyn BrowserDriver>,
    adapters: PlatformAdapterFactory,
    health: Arc<HealthMonitor>,
    ports: Arc<PortRegistry>,
    registry: SessionRegistry,
    notifications: broadcast::Sender<Notification>,
    workers: Mutex<HashMap<SessionId, JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn SessionStore>,
        browser: Arc<dyn BrowserDriver>,
        adapters: PlatformAdapterFactory,
        health: Arc<HealthMonitor>,
        ports: Arc<PortRegistry>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(config.router.port_buffer.max(16));
        Self {
            config,
            store,
            browser,
            adapters,
            health,
            ports,
            registry: SessionRegistry::new(),
            notifications,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn browser(&self) -> &Arc<dyn BrowserDriver> {
        &self.browser
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// 订阅会话通知
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }

    async fn active(&self, session_id: &str) -> Result<Arc<AutomationSession>, AutomationError> {
        self.registry
            .get_active(session_id)
            .await
            .ok_or_else(|| AutomationError::NotRunning(session_id.to_string()))
    }

    /// 启动一个自动投递会话
    pub async fn start_automation(&self, params: StartParams) -> Result<StartedSession, AutomationError> {
        let jobs_to_apply = params.validate()?;
        let platform = params.platform.trim().to_lowercase();
        let user_id = params.user_id.trim().to_string();

        let allowed = &self.config.app.supported_platforms;
        let configured = allowed.is_empty() || allowed.iter().any(|p| p.eq_ignore_ascii_case(&platform));
        if !configured || !self.adapters.supports(&platform) {
            return Err(AutomationError::PlatformUnsupported(platform));
        }
        let adapter = self.adapters.create(&platform)?;

        let session_config = SessionConfig {
            jobs_to_apply,
            preferences: params.preferences.clone(),
            user_profile: params.user_profile.clone(),
            api_host: if params.api_host.trim().is_empty() {
                self.config.app.api_host.clone()
            } else {
                params.api_host.clone()
            },
        };
        let target = build_search_target(&platform, &session_config.preferences);

        let session_id = self
            .store
            .create(NewSession {
                platform: platform.clone(),
                user_id: user_id.clone(),
                config: session_config.clone(),
            })
            .await;
        self.store
            .update(&session_id, SessionPatch::new().status(SessionStatus::Starting))
            .await?;
        self.notify(Notification::StatusChanged {
            session_id: session_id.clone(),
            from: SessionStatus::Created,
            to: SessionStatus::Starting,
            reason: None,
        });
        tracing::info!(%session_id, %platform, %user_id, jobs_to_apply, "starting session");

        let context_id = match self.browser.open_context(&target, params.window).await {
            Ok(id) => id,
            Err(e) => {
                self.abort_start(&session_id, &platform, None, &e).await;
                return Err(e);
            }
        };
        // 刚打开的上下文若已有归属，只可能是错过 Closed 事件留下的旧绑定
        if let Err(e) = self.registry.bind(context_id, &session_id).await {
            self.abort_start(&session_id, &platform, Some(context_id), &e).await;
            return Err(e);
        }
        self.registry
            .register_context(context_id, params.window, Some(target))
            .await;
        if let Err(e) = self
            .store
            .update(&session_id, SessionPatch::new().context_id(context_id))
            .await
        {
            self.abort_start(&session_id, &platform, Some(context_id), &e).await;
            return Err(e);
        }

        let context = SessionContext {
            session_id: session_id.clone(),
            platform: platform.clone(),
            user_id,
            user_profile: params.user_profile,
            api_host: session_config.api_host.clone(),
            session_config,
            preferences: params.preferences,
        };
        let recovery = Arc::new(ErrorRecoveryEngine::new(
            self.browser.clone(),
            self.config.recovery.policy(),
        ));
        let session = Arc::new(AutomationSession::new(
            context,
            context_id,
            adapter,
            recovery,
            SessionStatus::Starting,
        ));
        self.registry.insert_active(session.clone()).await;

        let port = self
            .ports
            .connect(PortName::new(platform, context_id), session_id.clone());
        if let Err(e) = self.browser.inject_context(context_id, &session.context).await {
            tracing::warn!(%session_id, context_id, "context injection failed: {}", e);
        }

        let worker = SessionWorker::new(session, port, WorkerSettings::from_config(&self.config));
        let handle = tokio::spawn(worker.run());
        if let Ok(mut workers) = self.workers.lock() {
            workers.insert(session_id.clone(), handle);
        }

        Ok(StartedSession {
            session_id,
            context_id,
        })
    }

    /// 启动阶段失败：starting → failed，并关闭已为本会话打开的上下文
    async fn abort_start(
        &self,
        session_id: &str,
        platform: &str,
        opened: Option<ContextId>,
        err: &AutomationError,
    ) {
        tracing::error!(%session_id, "session start failed: {}", err);
        let reason = err.to_string();
        let ctx = ErrorContext::new(platform, "start", opened.unwrap_or_default());
        let record = SessionErrorRecord::new(reason.clone()).with_class(recovery::classify(&reason, &ctx));
        let patch = SessionPatch::new()
            .status(SessionStatus::Failed)
            .error(record)
            .ended(reason.clone());
        let progress = self
            .patch_store(session_id, patch)
            .await
            .map(|session| session.progress)
            .unwrap_or_default();
        let mut released = self.registry.unbind_session(session_id).await;
        if let Some(context_id) = opened {
            if let Err(e) = self.browser.close_context(context_id).await {
                tracing::warn!(%session_id, context_id, "closing context after failed start: {}", e);
            }
            released.push(context_id);
        }
        self.registry.forget_contexts(&released).await;
        self.notify(Notification::StatusChanged {
            session_id: session_id.to_string(),
            from: SessionStatus::Starting,
            to: SessionStatus::Failed,
            reason: Some(reason.clone()),
        });
        self.notify(Notification::SessionFinished {
            session_id: session_id.to_string(),
            status: SessionStatus::Failed,
            reason: Some(reason),
            progress,
        });
    }

    /// 迁移状态，写存储并广播；非法迁移不产生任何副作用
    async fn transition(
        &self,
        session: &AutomationSession,
        next: SessionStatus,
        reason: Option<&str>,
    ) -> Result<SessionStatus, AutomationError> {
        let from = session.transition(next).await?;
        let mut patch = SessionPatch::new().status(next);
        if from == SessionStatus::Starting && next == SessionStatus::Running {
            patch = patch.started_now();
        }
        if next.is_terminal() {
            patch = patch.ended(reason.unwrap_or(next.as_str()));
        }
        self.patch_store(&session.id, patch).await;
        tracing::info!(session_id = %session.id, %from, to = %next, "session status changed");
        self.notify(Notification::StatusChanged {
            session_id: session.id.clone(),
            from,
            to: next,
            reason: reason.map(str::to_string),
        });
        Ok(from)
    }

    /// 存储写入失败只记日志：内存状态已迁移，不回滚
    async fn patch_store(&self, session_id: &str, patch: SessionPatch) -> Option<Session> {
        match self.store.update(session_id, patch).await {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(%session_id, "store update failed: {}", e);
                None
            }
        }
    }

    /// 失败记录一律带分类；url 为空时不附带
    fn classified_record(&self, session: &AutomationSession, message: &str, url: &str) -> SessionErrorRecord {
        let mut ctx = ErrorContext::new(session.platform.clone(), "apply", session.context_id);
        let mut record = SessionErrorRecord::new(message);
        if !url.is_empty() {
            ctx = ctx.with_url(url);
            record = record.with_url(url);
        }
        record.with_class(session.recovery.classify(message, &ctx))
    }

    fn post(&self, session: &AutomationSession, kind: PortMessageType) {
        let message = PortMessage::for_session(kind, session.id.clone());
        if let Err(e) = self.ports.send(session.context_id, message) {
            tracing::debug!(session_id = %session.id, "port message {:?} not delivered: {}", kind, e);
        }
    }

    /// worker 领取任务：starting → running
    pub async fn mark_running(&self, session_id: &str) -> Result<(), AutomationError> {
        let session = self.active(session_id).await?;
        if session.status().await == SessionStatus::Starting {
            self.transition(&session, SessionStatus::Running, None).await?;
        }
        Ok(())
    }

    pub async fn pause(&self, session_id: &str) -> Result<SessionStatus, AutomationError> {
        let session = self.active(session_id).await?;
        self.transition(&session, SessionStatus::Paused, Some("paused by user"))
            .await?;
        session.supervisor.set_paused(true);
        self.post(&session, PortMessageType::Pause);
        Ok(SessionStatus::Paused)
    }

    pub async fn resume(&self, session_id: &str) -> Result<SessionStatus, AutomationError> {
        let session = self.active(session_id).await?;
        self.transition(&session, SessionStatus::Running, Some("resumed by user"))
            .await?;
        session.supervisor.set_paused(false);
        self.post(&session, PortMessageType::Resume);
        Ok(SessionStatus::Running)
    }

    pub async fn stop(&self, session_id: &str) -> Result<SessionStatus, AutomationError> {
        self.force_stop(session_id, "stopped by user").await?;
        Ok(SessionStatus::Stopped)
    }

    /// 强制停止（用户、窗口关闭、关机）
    pub async fn force_stop(&self, session_id: &str, reason: &str) -> Result<(), AutomationError> {
        let session = self.active(session_id).await?;
        self.transition(&session, SessionStatus::Stopped, Some(reason))
            .await?;
        self.post(&session, PortMessageType::Stop);
        self.finalize(&session, SessionStatus::Stopped, reason).await;
        Ok(())
    }

    /// 队列结束：running | paused → completed
    pub async fn complete(&self, session_id: &str, reason: &str) -> Result<(), AutomationError> {
        let session = self.active(session_id).await?;
        self.transition(&session, SessionStatus::Completed, Some(reason))
            .await?;
        self.finalize(&session, SessionStatus::Completed, reason).await;
        Ok(())
    }

    /// 会话级致命错误
    pub async fn fail(&self, session_id: &str, reason: &str) -> Result<(), AutomationError> {
        let session = self.active(session_id).await?;
        let record = self.classified_record(&session, reason, "");
        self.terminate_failed(&session, reason, record).await
    }

    /// running | paused → failed；错误只记一条
    async fn terminate_failed(
        &self,
        session: &AutomationSession,
        reason: &str,
        record: SessionErrorRecord,
    ) -> Result<(), AutomationError> {
        self.transition(session, SessionStatus::Failed, Some(reason))
            .await?;
        self.patch_store(&session.id, SessionPatch::new().error(record))
            .await;
        self.finalize(session, SessionStatus::Failed, reason).await;
        Ok(())
    }

    /// 终态收尾：取消 worker、释放上下文与端口、清空恢复计数
    async fn finalize(&self, session: &AutomationSession, status: SessionStatus, reason: &str) {
        session.supervisor.cancel();
        if let Err(e) = session.adapter.stop().await {
            tracing::debug!(session_id = %session.id, "adapter stop failed: {}", e);
        }
        let mut released = self.registry.unbind_session(&session.id).await;
        for context_id in &released {
            self.ports.disconnect(*context_id);
        }
        self.ports.disconnect(session.context_id);
        if !released.contains(&session.context_id) {
            released.push(session.context_id);
        }
        self.registry.forget_contexts(&released).await;
        self.registry.remove_active(&session.id).await;
        session.recovery.reset();
        if let Ok(mut workers) = self.workers.lock() {
            workers.remove(&session.id);
        }

        let progress = session.progress().await;
        self.patch_store(&session.id, SessionPatch::new().progress(progress.clone()))
            .await;
        tracing::info!(
            session_id = %session.id,
            %status,
            completed = progress.completed,
            failed = progress.failed,
            skipped = progress.skipped,
            "session finished: {}",
            reason
        );
        self.notify(Notification::SessionFinished {
            session_id: session.id.clone(),
            status,
            reason: Some(reason.to_string()),
            progress,
        });
    }

    /// 会话快照与进度；活跃会话以内存进度为准
    pub async fn status(&self, session_id: &str) -> Result<(Session, Progress), AutomationError> {
        let session = self
            .store
            .get(session_id)
            .await
            .ok_or_else(|| AutomationError::NotFound(session_id.to_string()))?;
        let progress = match self.registry.get_active(session_id).await {
            Some(active) => active.progress().await,
            None => session.progress.clone(),
        };
        Ok((session, progress))
    }

    /// GET_SEARCH_TASK
    pub async fn search_task(&self, session_id: &str) -> Result<SearchTaskData, AutomationError> {
        self.mark_running(session_id).await?;
        let session = self.active(session_id).await?;
        Ok(SearchTaskData {
            limit: session.config.jobs_to_apply,
            submitted: self.registry.ledger(&session.user_id, &session.platform).await,
            preferences: session.config.preferences.clone(),
        })
    }

    /// GET_SEND_CV_TASK
    pub async fn cv_task(&self, session_id: &str) -> Result<ApplicationTaskData, AutomationError> {
        let session = self.active(session_id).await?;
        Ok(ApplicationTaskData {
            job: None,
            user_profile: session.config.user_profile.clone(),
            api_host: session.config.api_host.clone(),
        })
    }

    /// START_APPLICATION：账本里已有或本会话已派发的职位回复 DUPLICATE
    pub async fn begin_application(
        &self,
        session_id: &str,
        job: &JobQueueItem,
    ) -> Result<DispatchDecision, AutomationError> {
        let session = self.active(session_id).await?;
        let known = self
            .registry
            .ledger_contains(&session.user_id, &session.platform, &job.url)
            .await;
        let fresh = session.try_dispatch(&job.url).await;

        if known || !fresh {
            if fresh {
                let (counted, progress, _) = session.resolve(&job.url, LinkStatus::Skipped).await;
                if counted {
                    self.publish_progress(&session, progress).await;
                }
            }
            tracing::debug!(%session_id, url = %job.url, "job already submitted, skipping");
            return Ok(DispatchDecision::Duplicate);
        }

        self.notify(Notification::JobDispatched {
            session_id: session.id.clone(),
            url: job.url.clone(),
        });
        Ok(DispatchDecision::Apply(ApplicationTaskData {
            job: Some(job.clone()),
            user_profile: session.config.user_profile.clone(),
            api_host: session.config.api_host.clone(),
        }))
    }

    async fn publish_progress(&self, session: &AutomationSession, progress: Progress) {
        self.patch_store(&session.id, SessionPatch::new().progress(progress.clone()))
            .await;
        self.notify(Notification::ProgressUpdated {
            session_id: session.id.clone(),
            progress,
        });
    }

    /// APPLICATION_SUCCESS / DUPLICATE / ERROR：写账本、计数、健康指标；致命错误使会话失败
    pub async fn record_outcome(&self, session_id: &str, report: &JobReport) -> Result<bool, AutomationError> {
        let session = self.active(session_id).await?;

        if !report.url.is_empty()
            && !self
                .registry
                .ledger_contains(&session.user_id, &session.platform, &report.url)
                .await
        {
            self.registry
                .record_submission(
                    &session.user_id,
                    &session.platform,
                    SubmittedLink::new(report.url.clone(), report.status, report.tries),
                )
                .await;
        }

        let (counted, progress, elapsed) = session.resolve(&report.url, report.status).await;
        if counted {
            match report.status {
                LinkStatus::Success => self.health.record_application(true),
                LinkStatus::Failed => self.health.record_application(false),
                LinkStatus::Skipped => {}
            }
            if let Some(elapsed) = elapsed {
                self.health.record_response_time(elapsed);
            }
            self.publish_progress(&session, progress).await;
        }

        let failure = report
            .error
            .as_deref()
            .filter(|_| report.status == LinkStatus::Failed)
            .map(|message| {
                let mut record = self.classified_record(&session, message, &report.url);
                if let Some(class) = report.class {
                    record = record.with_class(class);
                }
                record
            });
        if let Some(record) = &failure {
            self.health.record_error();
            self.notify(Notification::ErrorReported {
                session_id: session.id.clone(),
                message: record.message.clone(),
                fatal: report.fatal,
            });
        }

        if report.fatal {
            let reason = report.error.clone().unwrap_or_else(|| "fatal error".to_string());
            let record = failure.unwrap_or_else(|| self.classified_record(&session, &reason, &report.url));
            self.terminate_failed(&session, &reason, record).await?;
        } else if let Some(record) = failure {
            self.patch_store(session_id, SessionPatch::new().error(record))
                .await;
        }
        Ok(counted)
    }

    /// applicationSubmitted：页面侧直接报告的投递成功
    pub async fn application_submitted(
        &self,
        session_id: &str,
        job_url: &str,
        application: Value,
    ) -> Result<bool, AutomationError> {
        if job_url.trim().is_empty() {
            return Err(AutomationError::Validation("jobData.url is required".into()));
        }
        self.record_outcome(session_id, &JobReport::success(job_url, 0, application))
            .await
    }

    /// reportProgress：只采纳当前职位，计数以控制端为准
    pub async fn report_progress(&self, session_id: &str, current: Option<String>) -> Result<Progress, AutomationError> {
        let session = self.active(session_id).await?;
        let progress = session.set_current(current).await;
        self.publish_progress(&session, progress.clone()).await;
        Ok(progress)
    }

    /// reportError：归类后记入会话，不影响会话状态
    pub async fn report_error(
        &self,
        session_id: &str,
        message: &str,
        context: Value,
    ) -> Result<ErrorClass, AutomationError> {
        let session = self.active(session_id).await?;
        let selector = context.get("selector").and_then(Value::as_str);
        let mut ctx = ErrorContext::new(session.platform.clone(), "content", session.context_id)
            .with_selector(selector);
        if let Some(url) = context.get("url").and_then(Value::as_str) {
            ctx = ctx.with_url(url);
        }
        let class = session.recovery.classify(message, &ctx);

        self.health.record_error();
        let record = SessionErrorRecord::new(message)
            .with_class(class)
            .with_context(context);
        self.store
            .update(session_id, SessionPatch::new().error(record))
            .await?;
        tracing::warn!(%session_id, %class, "content reported error: {}", message);
        self.notify(Notification::ErrorReported {
            session_id: session.id.clone(),
            message: message.to_string(),
            fatal: false,
        });
        Ok(class)
    }

    /// contentScriptReady：页面重新加载后重新注入会话上下文
    pub async fn content_ready(&self, session_id: &str, context_id: Option<ContextId>) -> Result<ContextId, AutomationError> {
        let session = self.active(session_id).await?;
        let context_id = context_id.unwrap_or(session.context_id);
        match self.registry.session_for(context_id).await {
            Some(owner) if owner == session.id => {}
            Some(owner) => {
                return Err(AutomationError::ContextConflict {
                    context_id,
                    session_id: owner,
                })
            }
            None => {
                return Err(AutomationError::Validation(format!(
                    "context {context_id} is not bound to {session_id}"
                )))
            }
        }
        self.browser.inject_context(context_id, &session.context).await?;
        Ok(context_id)
    }

    pub async fn active_session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .registry
            .active_sessions()
            .await
            .into_iter()
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// 停止全部会话并等待 worker 退出
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain().map(|(_, h)| h).collect(),
            Err(_) => Vec::new(),
        };
        for session_id in self.active_session_ids().await {
            if let Err(e) = self.force_stop(&session_id, "shutdown").await {
                tracing::debug!(%session_id, "shutdown stop skipped: {}", e);
            }
        }
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!("worker did not exit within {:?}", SHUTDOWN_GRACE);
            }
        }
    }
}
