//! 会话存储抽象层
//!
//! 纯 CRUD，不含业务逻辑；状态迁移的合法性由编排层检查。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::session::{NewSession, Session, SessionFilter, SessionPatch};
use crate::core::{AutomationError, SessionId};

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 创建会话（状态 created），返回新 ID
    async fn create(&self, params: NewSession) -> SessionId;

    /// 浅合并更新；未知 ID 返回 NotFound
    async fn update(&self, id: &str, patch: SessionPatch) -> Result<Session, AutomationError>;

    async fn get(&self, id: &str) -> Option<Session>;

    /// 按创建时间排序
    async fn list(&self, filter: &SessionFilter) -> Vec<Session>;
}

/// 内存会话存储
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, params: NewSession) -> SessionId {
        let session = Session::new(params);
        let id = session.id.clone();
        tracing::debug!(session_id = %id, platform = %session.platform, "session record created");
        self.sessions.write().await.insert(id.clone(), session);
        id
    }

    async fn update(&self, id: &str, patch: SessionPatch) -> Result<Session, AutomationError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| AutomationError::NotFound(id.to_string()))?;
        patch.apply(session);
        Ok(session.clone())
    }

    async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn list(&self, filter: &SessionFilter) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut matched: Vec<Session> = sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        matched
    }
}

/// 创建默认会话存储
pub fn create_session_store() -> Arc<dyn SessionStore> {
    Arc::new(MemorySessionStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionStatus;
    use crate::gateway::session::SessionConfig;

    fn params(user: &str) -> NewSession {
        NewSession {
            platform: "indeed".into(),
            user_id: user.into(),
            config: SessionConfig {
                jobs_to_apply: 2,
                ..SessionConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn test_create_issues_unique_ids() {
        let store = MemorySessionStore::new();
        let a = store.create(params("u1")).await;
        let b = store.create(params("u1")).await;
        assert_ne!(a, b);
        assert_eq!(store.get(&a).await.unwrap().status, SessionStatus::Created);
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let store = MemorySessionStore::new();
        let err = store
            .update("session_missing", SessionPatch::new().status(SessionStatus::Running))
            .await
            .unwrap_err();
        assert_eq!(err, AutomationError::NotFound("session_missing".into()));
    }

    #[tokio::test]
    async fn test_update_returns_merged_session() {
        let store = MemorySessionStore::new();
        let id = store.create(params("u1")).await;
        let updated = store
            .update(&id, SessionPatch::new().status(SessionStatus::Starting).context_id(3))
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Starting);
        assert_eq!(store.get(&id).await.unwrap().context_id, Some(3));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = create_session_store();
        let a = store.create(params("u1")).await;
        store.create(params("u2")).await;
        store
            .update(&a, SessionPatch::new().status(SessionStatus::Failed))
            .await
            .unwrap();

        assert_eq!(store.list(&SessionFilter::default()).await.len(), 2);
        assert_eq!(store.list(&SessionFilter::for_user("u1")).await.len(), 1);
        assert!(store.list(&SessionFilter::for_user("u1").active()).await.is_empty());
    }
}
