//! 会话记录
//!
//! Session 由 SessionStore 独占，外部只能通过 SessionPatch 浅合并修改。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ContextId, ErrorClass, Progress, SessionId, SessionStatus};
use crate::platform::JobPreferences;

/// 会话配置快照（创建后不变）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub jobs_to_apply: u32,
    pub preferences: JobPreferences,
    pub user_profile: Value,
    pub api_host: String,
}

/// 会话内记录的一次错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionErrorRecord {
    pub message: String,
    pub class: Option<ErrorClass>,
    pub url: Option<String>,
    #[serde(default)]
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

impl SessionErrorRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: None,
            url: None,
            context: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// 会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub platform: String,
    pub user_id: String,
    pub status: SessionStatus,
    /// 主窗口
    pub context_id: Option<ContextId>,
    pub config: SessionConfig,
    pub progress: Progress,
    pub errors: Vec<SessionErrorRecord>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
}

/// 创建参数
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub platform: String,
    pub user_id: String,
    pub config: SessionConfig,
}

impl Session {
    pub fn new(params: NewSession) -> Self {
        let progress = Progress::new(params.config.jobs_to_apply);
        Self {
            id: format!("session_{}", uuid::Uuid::new_v4()),
            platform: params.platform,
            user_id: params.user_id,
            status: SessionStatus::Created,
            context_id: None,
            config: params.config,
            progress,
            errors: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            end_reason: None,
        }
    }
}

/// 浅合并补丁：为 None 的字段保持不变；error 追加到 errors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub context_id: Option<ContextId>,
    pub progress: Option<Progress>,
    pub error: Option<SessionErrorRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
}

impl SessionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn context_id(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn progress(mut self, progress: Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn error(mut self, error: SessionErrorRecord) -> Self {
        self.error = Some(error);
        self
    }

    pub fn started_now(mut self) -> Self {
        self.started_at = Some(Utc::now());
        self
    }

    /// 终态：记录结束时间与原因
    pub fn ended(mut self, reason: impl Into<String>) -> Self {
        self.ended_at = Some(Utc::now());
        self.end_reason = Some(reason.into());
        self
    }

    pub fn apply(self, session: &mut Session) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(context_id) = self.context_id {
            session.context_id = Some(context_id);
        }
        if let Some(progress) = self.progress {
            session.progress = progress;
        }
        if let Some(error) = self.error {
            session.errors.push(error);
        }
        if let Some(started_at) = self.started_at {
            session.started_at = Some(started_at);
        }
        if let Some(ended_at) = self.ended_at {
            session.ended_at = Some(ended_at);
        }
        if let Some(reason) = self.end_reason {
            session.end_reason = Some(reason);
        }
    }
}

/// list 过滤条件；字段为空表示不过滤
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub user_id: Option<String>,
    pub platform: Option<String>,
    pub status: Option<SessionStatus>,
    /// 只看非终态
    pub active_only: bool,
}

impl SessionFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn matches(&self, session: &Session) -> bool {
        self.user_id.as_ref().map_or(true, |u| *u == session.user_id)
            && self.platform.as_ref().map_or(true, |p| *p == session.platform)
            && self.status.map_or(true, |s| s == session.status)
            && (!self.active_only || !session.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> Session {
        Session::new(NewSession {
            platform: "linkedin".into(),
            user_id: "u1".into(),
            config: SessionConfig {
                jobs_to_apply: 5,
                ..SessionConfig::default()
            },
        })
    }

    #[test]
    fn test_new_session_starts_created() {
        let session = new_session();
        assert_eq!(session.status, SessionStatus::Created);
        assert_eq!(session.progress.total, 5);
        assert!(session.id.starts_with("session_"));
    }

    #[test]
    fn test_patch_is_shallow_merge() {
        let mut session = new_session();
        SessionPatch::new()
            .status(SessionStatus::Starting)
            .context_id(7)
            .apply(&mut session);
        SessionPatch::new()
            .error(SessionErrorRecord::new("boom"))
            .apply(&mut session);

        assert_eq!(session.status, SessionStatus::Starting);
        assert_eq!(session.context_id, Some(7));
        assert_eq!(session.errors.len(), 1);
        assert!(session.ended_at.is_none());
    }

    #[test]
    fn test_filter() {
        let mut session = new_session();
        assert!(SessionFilter::for_user("u1").active().matches(&session));
        assert!(!SessionFilter::for_user("u2").matches(&session));
        session.status = SessionStatus::Stopped;
        assert!(!SessionFilter::for_user("u1").active().matches(&session));
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let json = serde_json::to_value(new_session()).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["status"], "created");
        assert_eq!(json["config"]["jobsToApply"], 5);
    }
}
