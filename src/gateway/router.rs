//! 消息路由
//!
//! 三类输入：
//! - 控制面请求（startApplying / pauseApplying / ... ），并发处理，同一 (动作, 用户, 平台) 同时只允许一个在途
//! - PortChannel 入站消息，在 run 循环中按到达顺序逐条处理并回复
//! - 浏览器上下文事件：子窗口继承会话、导航后重新注入、窗口关闭时停止受影响的会话

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::message::{
    ControlAction, ControlMessage, ControlResponse, JobReport, PortMessage, PortMessageType,
    SessionContext,
};
use super::port::Inbound;
use super::registry::AutomationSession;
use crate::core::orchestrator::{DispatchDecision, Orchestrator, StartParams};
use crate::core::{AutomationError, ContextId, SessionId};
use crate::platform::ContextEvent;
use crate::queue::JobQueueItem;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    action: ControlAction,
    user_id: String,
    platform: String,
}

/// 在途标记，离开作用域时释放
struct InFlightGuard {
    set: Arc<Mutex<HashSet<RequestKey>>>,
    key: RequestKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.key);
        }
    }
}

/// 消息路由器
pub struct MessageRouter {
    orchestrator: Arc<Orchestrator>,
    in_flight: Arc<Mutex<HashSet<RequestKey>>>,
    request_timeout: Duration,
}

impl MessageRouter {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let request_timeout = Duration::from_secs(orchestrator.config().router.request_timeout_secs);
        Self {
            orchestrator,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            request_timeout,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn acquire(&self, key: RequestKey) -> Result<InFlightGuard, AutomationError> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|e| AutomationError::ChannelClosed(e.to_string()))?;
        if !set.insert(key.clone()) {
            return Err(AutomationError::DuplicateRequest {
                action: key.action.as_str().to_string(),
                user_id: key.user_id,
                platform: key.platform,
            });
        }
        Ok(InFlightGuard {
            set: self.in_flight.clone(),
            key,
        })
    }

    /// 处理控制面请求；错误统一转成 `{status: "error"}` 响应
    pub async fn handle_control(&self, message: ControlMessage) -> ControlResponse {
        let action = message.kind;
        let result = match tokio::time::timeout(self.request_timeout, self.dispatch_control(message)).await {
            Ok(result) => result,
            Err(_) => Err(AutomationError::Timeout(format!(
                "{} did not finish within {:?}",
                action.as_str(),
                self.request_timeout
            ))),
        };
        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(action = action.as_str(), "control request failed: {}", e);
                ControlResponse::error(&e)
            }
        }
    }

    async fn dispatch_control(&self, message: ControlMessage) -> Result<ControlResponse, AutomationError> {
        let orchestrator = &self.orchestrator;
        match message.kind {
            ControlAction::StartApplying => {
                let params: StartParams = message.payload_as()?;
                let guard = self.acquire(RequestKey {
                    action: ControlAction::StartApplying,
                    user_id: params.user_id.trim().to_string(),
                    platform: params.platform.trim().to_lowercase(),
                })?;
                // 独立任务：请求超时后启动仍会完成，不会停在 starting
                let orchestrator = orchestrator.clone();
                let started = tokio::spawn(async move {
                    let _guard = guard;
                    orchestrator.start_automation(params).await
                })
                .await
                .map_err(|e| AutomationError::ChannelClosed(format!("start task failed: {e}")))??;
                Ok(ControlResponse {
                    session_id: Some(started.session_id),
                    context_id: Some(started.context_id),
                    ..ControlResponse::status("started")
                })
            }
            ControlAction::PauseApplying | ControlAction::ResumeApplying | ControlAction::StopApplying => {
                let session_id = message.require_session_id()?;
                let session = orchestrator
                    .registry()
                    .get_active(&session_id)
                    .await
                    .ok_or_else(|| AutomationError::NotRunning(session_id.clone()))?;
                let _guard = self.acquire(RequestKey {
                    action: message.kind,
                    user_id: session.user_id.clone(),
                    platform: session.platform.clone(),
                })?;
                let status = match message.kind {
                    ControlAction::PauseApplying => orchestrator.pause(&session_id).await?,
                    ControlAction::ResumeApplying => orchestrator.resume(&session_id).await?,
                    _ => orchestrator.stop(&session_id).await?,
                };
                Ok(ControlResponse {
                    session_id: Some(session_id),
                    ..ControlResponse::status(status.as_str())
                })
            }
            ControlAction::GetStatus => {
                let session_id = message.require_session_id()?;
                let (session, progress) = orchestrator.status(&session_id).await?;
                Ok(ControlResponse {
                    session: Some(session),
                    progress: Some(progress),
                    ..ControlResponse::status("success")
                })
            }
            ControlAction::ContentScriptReady => {
                let session_id = message.require_session_id()?;
                // 页面自带的上下文须属于同一会话，否则是上一个会话残留的脚本
                if let Some(held) = message.payload.get("sessionContext") {
                    let held = SessionContext::from_payload(held)?;
                    if held.session_id != session_id {
                        return Err(AutomationError::Validation(format!(
                            "content script holds context of session {}",
                            held.session_id
                        )));
                    }
                }
                let context_id = message.payload.get("contextId").and_then(Value::as_u64);
                let context_id = orchestrator.content_ready(&session_id, context_id).await?;
                Ok(ControlResponse {
                    context_id: Some(context_id),
                    ..ControlResponse::ok()
                })
            }
            ControlAction::ReportProgress => {
                let session_id = message.require_session_id()?;
                let current = message
                    .payload
                    .pointer("/progress/current")
                    .or_else(|| message.payload.get("current"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let progress = orchestrator.report_progress(&session_id, current).await?;
                Ok(ControlResponse {
                    progress: Some(progress),
                    ..ControlResponse::ok()
                })
            }
            ControlAction::ReportError => {
                let session_id = message.require_session_id()?;
                let error = message
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .filter(|e| !e.trim().is_empty())
                    .ok_or_else(|| AutomationError::Validation("error is required".into()))?;
                let context = message.payload.get("context").cloned().unwrap_or(Value::Null);
                orchestrator.report_error(&session_id, error, context).await?;
                Ok(ControlResponse::ok())
            }
            ControlAction::ApplicationSubmitted => {
                let session_id = message.require_session_id()?;
                let url = message
                    .payload
                    .pointer("/jobData/url")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let application = message
                    .payload
                    .get("applicationData")
                    .cloned()
                    .unwrap_or(Value::Null);
                orchestrator
                    .application_submitted(&session_id, url, application)
                    .await?;
                Ok(ControlResponse::ok())
            }
        }
    }

    /// 处理一条端口消息，必要时回复到同一端口
    pub async fn handle_port_message(&self, inbound: Inbound) {
        let Inbound { port, message } = inbound;
        let ports = self.orchestrator.ports();
        let Some(owner) = ports.route(&port) else {
            tracing::debug!(port = %port, kind = ?message.kind, "message from disconnected port dropped");
            return;
        };
        if let Some(claimed) = message.session_id.as_deref() {
            if claimed != owner {
                tracing::warn!(port = %port, %claimed, %owner, "session id does not match port owner");
                return;
            }
        }

        let reply = match self.port_reply(&owner, &message).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(port = %port, kind = ?message.kind, "port message failed: {}", e);
                Some(
                    PortMessage::for_session(PortMessageType::Error, owner.clone())
                        .with_payload(&json!({ "error": e.to_string(), "code": e.code() })),
                )
            }
        };
        if let Some(reply) = reply {
            if let Err(e) = ports.send(port.context_id, reply) {
                tracing::debug!(port = %port, "reply not delivered: {}", e);
            }
        }
    }

    async fn port_reply(
        &self,
        session_id: &SessionId,
        message: &PortMessage,
    ) -> Result<Option<PortMessage>, AutomationError> {
        let orchestrator = &self.orchestrator;
        let reply = |kind: PortMessageType| PortMessage::for_session(kind, session_id.clone());

        match message.kind {
            PortMessageType::GetSearchTask => {
                let task = orchestrator.search_task(session_id).await?;
                Ok(Some(reply(PortMessageType::SearchTaskData).with_payload(&task)))
            }
            PortMessageType::GetSendCvTask => {
                let task = orchestrator.cv_task(session_id).await?;
                Ok(Some(reply(PortMessageType::ApplicationTaskData).with_payload(&task)))
            }
            PortMessageType::StartApplication => {
                let job: JobQueueItem = message.payload_as()?;
                match orchestrator.begin_application(session_id, &job).await? {
                    DispatchDecision::Apply(task) => {
                        Ok(Some(reply(PortMessageType::ApplicationTaskData).with_payload(&task)))
                    }
                    DispatchDecision::Duplicate => Ok(Some(
                        reply(PortMessageType::Duplicate).with_payload(&json!({ "url": job.url })),
                    )),
                }
            }
            PortMessageType::ApplicationStarting | PortMessageType::ApplicationStatus => {
                tracing::debug!(%session_id, kind = ?message.kind, payload = %message.payload, "application update");
                Ok(None)
            }
            PortMessageType::ApplicationSuccess | PortMessageType::Duplicate | PortMessageType::Error => {
                let report: JobReport = message.payload_as()?;
                orchestrator.record_outcome(session_id, &report).await?;
                if report.fatal {
                    return Ok(None);
                }
                Ok(Some(reply(PortMessageType::SearchNext)))
            }
            PortMessageType::SearchCompleted => {
                let reason = message
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("exhausted")
                    .to_string();
                orchestrator.complete(session_id, &reason).await?;
                Ok(None)
            }
            other => {
                tracing::warn!(%session_id, "unexpected {:?} from worker", other);
                Ok(None)
            }
        }
    }

    /// 浏览器上下文事件
    pub async fn handle_context_event(&self, event: ContextEvent) {
        let orchestrator = &self.orchestrator;
        let registry = orchestrator.registry();
        match event {
            ContextEvent::Created {
                context_id,
                parent: Some(parent),
                url,
            } => {
                let Some(session_id) = registry.session_for(parent).await else {
                    return;
                };
                let Some(session) = registry.get_active(&session_id).await else {
                    return;
                };
                registry.register_context(context_id, Some(parent), Some(url)).await;
                match registry.bind(context_id, &session_id).await {
                    Ok(()) => {
                        tracing::debug!(%session_id, context_id, parent, "child context inherits session");
                        if let Err(e) = orchestrator.browser().inject_context(context_id, &session.context).await {
                            tracing::warn!(%session_id, context_id, "context injection failed: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!(context_id, "child context not bound: {}", e),
                }
            }
            ContextEvent::Created { .. } => {}
            ContextEvent::Navigated { context_id, url } => {
                let Some(session) = self.bound_session(context_id).await else {
                    return;
                };
                let previous = registry.record_navigation(context_id, &url).await;
                if let Err(e) = orchestrator.browser().inject_context(context_id, &session.context).await {
                    tracing::warn!(session_id = %session.id, context_id, "context re-injection failed: {}", e);
                }
                orchestrator.health().record_page_load();
                if session.adapter.is_application_page(&url) {
                    tracing::debug!(session_id = %session.id, %url, "application page loaded");
                }
                session.adapter.on_navigation(previous.as_deref(), &url).await;
            }
            ContextEvent::DomSignificantChange { context_id } => {
                if let Some(session) = self.bound_session(context_id).await {
                    session.adapter.on_dom_change().await;
                }
            }
            ContextEvent::Closed { context_id } => {
                let released = registry.release_context_tree(context_id).await;
                let closed: Vec<ContextId> = released.iter().map(|b| b.context_id).collect();
                let mut affected: Vec<SessionId> = Vec::new();
                for binding in released {
                    if !affected.contains(&binding.session_id) {
                        affected.push(binding.session_id);
                    }
                }
                for session_id in affected {
                    let Some(session) = registry.get_active(&session_id).await else {
                        continue;
                    };
                    let primary_closed = closed.contains(&session.context_id);
                    if primary_closed || !registry.has_bindings(&session_id).await {
                        tracing::info!(%session_id, context_id, "bound context closed, stopping session");
                        if let Err(e) = orchestrator.force_stop(&session_id, "context closed").await {
                            tracing::debug!(%session_id, "stop after close skipped: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn bound_session(&self, context_id: ContextId) -> Option<Arc<AutomationSession>> {
        let registry = self.orchestrator.registry();
        let session_id = registry.session_for(context_id).await?;
        registry.get_active(&session_id).await
    }

    /// 主循环：端口消息与上下文事件按到达顺序处理，直到 shutdown
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut events: broadcast::Receiver<ContextEvent>,
        shutdown: CancellationToken,
    ) {
        let mut events_open = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => self.handle_port_message(message).await,
                    None => break,
                },
                event = events.recv(), if events_open => match event {
                    Ok(event) => self.handle_context_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "context events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("context event stream closed");
                        events_open = false;
                    }
                },
            }
        }
        tracing::info!("message router stopped");
    }
}
