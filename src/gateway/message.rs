//! 消息协议定义
//!
//! 控制面（请求 / 响应）与数据面（PortChannel 上的有序流）共用同一信封 `{type, sessionId, payload}`，
//! type 分别为 ControlAction 与 PortMessageType。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::{Session, SessionConfig};
use crate::core::{AutomationError, ContextId, ErrorClass, Progress, SessionId, SessionStatus};
use crate::platform::JobPreferences;
use crate::queue::{JobQueueItem, LinkStatus, SubmittedLink};

/// 消息信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message<T> {
    #[serde(rename = "type")]
    pub kind: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub payload: Value,
}

impl<T> Message<T> {
    pub fn new(kind: T) -> Self {
        Self {
            kind,
            session_id: None,
            payload: Value::Null,
        }
    }

    pub fn for_session(kind: T, session_id: impl Into<SessionId>) -> Self {
        Self {
            kind,
            session_id: Some(session_id.into()),
            payload: Value::Null,
        }
    }

    pub fn with_payload<P: Serialize>(mut self, payload: &P) -> Self {
        self.payload = serde_json::to_value(payload).unwrap_or_default();
        self
    }

    /// 按类型解析 payload；格式不符为 Validation 错误
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, AutomationError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| AutomationError::Validation(format!("invalid payload: {e}")))
    }

    /// 取必填的 sessionId（信封或 payload 中）
    pub fn require_session_id(&self) -> Result<SessionId, AutomationError> {
        self.session_id
            .clone()
            .or_else(|| {
                self.payload
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AutomationError::Validation("sessionId is required".into()))
    }
}

/// 控制面动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlAction {
    StartApplying,
    PauseApplying,
    ResumeApplying,
    StopApplying,
    GetStatus,
    ContentScriptReady,
    ReportProgress,
    ReportError,
    ApplicationSubmitted,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::StartApplying => "startApplying",
            ControlAction::PauseApplying => "pauseApplying",
            ControlAction::ResumeApplying => "resumeApplying",
            ControlAction::StopApplying => "stopApplying",
            ControlAction::GetStatus => "getStatus",
            ControlAction::ContentScriptReady => "contentScriptReady",
            ControlAction::ReportProgress => "reportProgress",
            ControlAction::ReportError => "reportError",
            ControlAction::ApplicationSubmitted => "applicationSubmitted",
        }
    }
}

/// 数据面消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortMessageType {
    GetSearchTask,
    SearchTaskData,
    GetSendCvTask,
    ApplicationTaskData,
    StartApplication,
    ApplicationStarting,
    ApplicationStatus,
    ApplicationSuccess,
    SearchNext,
    Duplicate,
    Error,
    SearchCompleted,
    Pause,
    Resume,
    Stop,
}

pub type ControlMessage = Message<ControlAction>;
pub type PortMessage = Message<PortMessageType>;

/// 控制面响应；未设置的字段不序列化
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ControlResponse {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Self::default()
        }
    }

    pub fn ok() -> Self {
        Self {
            success: Some(true),
            ..Self::default()
        }
    }

    pub fn error(err: &AutomationError) -> Self {
        Self {
            status: Some("error".into()),
            success: Some(false),
            error: Some(err.to_string()),
            code: Some(err.code().to_string()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.status.as_deref() == Some("error") || self.success == Some(false)
    }
}

/// 会话上下文：注入到页面、子上下文继承
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_id: SessionId,
    pub platform: String,
    pub user_id: String,
    #[serde(default)]
    pub user_profile: Value,
    #[serde(default)]
    pub session_config: SessionConfig,
    #[serde(default)]
    pub api_host: String,
    #[serde(default)]
    pub preferences: JobPreferences,
}

impl SessionContext {
    /// 在边界处一次性校验
    pub fn from_payload(value: &Value) -> Result<Self, AutomationError> {
        let context: SessionContext = serde_json::from_value(value.clone())
            .map_err(|e| AutomationError::Validation(format!("invalid session context: {e}")))?;
        for (name, field) in [
            ("sessionId", &context.session_id),
            ("platform", &context.platform),
            ("userId", &context.user_id),
        ] {
            if field.trim().is_empty() {
                return Err(AutomationError::Validation(format!(
                    "session context is missing {name}"
                )));
            }
        }
        Ok(context)
    }
}

/// SEARCH_TASK_DATA：队列上限与已投递记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchTaskData {
    pub limit: u32,
    pub submitted: Vec<SubmittedLink>,
    pub preferences: JobPreferences,
}

/// APPLICATION_TASK_DATA：单个职位的投递资料；回复 GET_SEND_CV_TASK 时没有 job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationTaskData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobQueueItem>,
    #[serde(default)]
    pub user_profile: Value,
    #[serde(default)]
    pub api_host: String,
}

/// APPLICATION_SUCCESS / DUPLICATE / ERROR 的载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub url: String,
    pub status: LinkStatus,
    #[serde(default)]
    pub tries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<Value>,
    /// 对整个会话致命（平台不支持等）
    #[serde(default)]
    pub fatal: bool,
}

impl JobReport {
    pub fn success(url: impl Into<String>, tries: u32, application: Value) -> Self {
        Self {
            url: url.into(),
            status: LinkStatus::Success,
            tries,
            error: None,
            class: None,
            application: Some(application),
            fatal: false,
        }
    }

    pub fn skipped(url: impl Into<String>, tries: u32) -> Self {
        Self {
            url: url.into(),
            status: LinkStatus::Skipped,
            tries,
            error: None,
            class: None,
            application: None,
            fatal: false,
        }
    }

    pub fn failed(url: impl Into<String>, tries: u32, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: LinkStatus::Failed,
            tries,
            error: Some(error.into()),
            class: None,
            application: None,
            fatal: false,
        }
    }

    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

/// 对外通知（broadcast）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ProgressUpdated {
        session_id: SessionId,
        progress: Progress,
    },
    #[serde(rename_all = "camelCase")]
    ErrorReported {
        session_id: SessionId,
        message: String,
        fatal: bool,
    },
    #[serde(rename_all = "camelCase")]
    JobDispatched { session_id: SessionId, url: String },
    #[serde(rename_all = "camelCase")]
    SessionFinished {
        session_id: SessionId,
        status: SessionStatus,
        reason: Option<String>,
        progress: Progress,
    },
}

impl Notification {
    pub fn session_id(&self) -> &str {
        match self {
            Notification::StatusChanged { session_id, .. }
            | Notification::ProgressUpdated { session_id, .. }
            | Notification::ErrorReported { session_id, .. }
            | Notification::JobDispatched { session_id, .. }
            | Notification::SessionFinished { session_id, .. } => session_id,
        }
    }
}
