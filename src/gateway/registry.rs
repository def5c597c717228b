//! 会话注册表
//!
//! 集中管理四张表，每张表一把锁：
//! - active：活跃会话（session_id → AutomationSession）
//! - bindings：上下文归属（context_id → ContextBinding），一个上下文只属于一个会话
//! - tree：上下文父子关系与最近 URL，关闭窗口时据此找出整棵子树
//! - ledger：按 (user_id, platform) 汇总的投递记录，跨会话去重
//!
//! 锁顺序 active → bindings → tree → ledger；任何方法都不同时持有两把锁。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use super::message::SessionContext;
use super::session::SessionConfig;
use crate::core::recovery::ErrorRecoveryEngine;
use crate::core::{AutomationError, ContextId, Progress, SessionId, SessionStatus, SessionSupervisor};
use crate::platform::PlatformAdapter;
use crate::queue::{normalize_url, LinkStatus, SubmittedLink};

/// 上下文归属
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBinding {
    pub context_id: ContextId,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct ContextNode {
    parent: Option<ContextId>,
    last_url: Option<String>,
}

/// 会话运行时可变部分
#[derive(Debug)]
struct LiveState {
    status: SessionStatus,
    progress: Progress,
    dispatched: HashSet<String>,
    resolved: HashSet<String>,
    dispatched_at: Option<Instant>,
}

/// 内存中的活跃会话：配置快照不可变，进度与状态在锁内更新
pub struct AutomationSession {
    pub id: SessionId,
    pub platform: String,
    pub user_id: String,
    /// 主窗口
    pub context_id: ContextId,
    pub config: Arc<SessionConfig>,
    pub context: Arc<SessionContext>,
    pub adapter: Arc<dyn PlatformAdapter>,
    pub recovery: Arc<ErrorRecoveryEngine>,
    pub supervisor: SessionSupervisor,
    live: Mutex<LiveState>,
}

impl AutomationSession {
    pub fn new(
        context: SessionContext,
        context_id: ContextId,
        adapter: Arc<dyn PlatformAdapter>,
        recovery: Arc<ErrorRecoveryEngine>,
        status: SessionStatus,
    ) -> Self {
        let progress = Progress::new(context.session_config.jobs_to_apply);
        Self {
            id: context.session_id.clone(),
            platform: context.platform.clone(),
            user_id: context.user_id.clone(),
            context_id,
            config: Arc::new(context.session_config.clone()),
            context: Arc::new(context),
            adapter,
            recovery,
            supervisor: SessionSupervisor::new(),
            live: Mutex::new(LiveState {
                status,
                progress,
                dispatched: HashSet::new(),
                resolved: HashSet::new(),
                dispatched_at: None,
            }),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.live.lock().await.status
    }

    pub async fn progress(&self) -> Progress {
        self.live.lock().await.progress.clone()
    }

    /// 按状态图迁移，返回旧状态；同一迁移只会成功一次
    pub async fn transition(&self, next: SessionStatus) -> Result<SessionStatus, AutomationError> {
        let mut live = self.live.lock().await;
        let from = live.status;
        if !from.can_transition_to(next) {
            return Err(AutomationError::InvalidTransition { from, to: next });
        }
        live.status = next;
        Ok(from)
    }

    /// 标记职位已派发；同一规范化 URL 只能派发一次
    pub async fn try_dispatch(&self, url: &str) -> bool {
        let mut live = self.live.lock().await;
        let inserted = live.dispatched.insert(normalize_url(url));
        if inserted {
            live.progress.current = Some(url.to_string());
            live.dispatched_at = Some(Instant::now());
        }
        inserted
    }

    /// 记录终结结果；返回 (是否计入, 最新进度, 派发到现在的耗时)
    pub async fn resolve(
        &self,
        url: &str,
        status: LinkStatus,
    ) -> (bool, Progress, Option<std::time::Duration>) {
        let mut live = self.live.lock().await;
        let key = normalize_url(url);
        let counted = live.dispatched.contains(&key)
            && live.resolved.insert(key)
            && live.progress.record(status);
        let elapsed = if counted {
            live.dispatched_at.take().map(|t| t.elapsed())
        } else {
            None
        };
        if counted && live.progress.current.as_deref() == Some(url) {
            live.progress.current = None;
        }
        (counted, live.progress.clone(), elapsed)
    }

    pub async fn set_current(&self, url: Option<String>) -> Progress {
        let mut live = self.live.lock().await;
        live.progress.current = url;
        live.progress.clone()
    }
}

impl std::fmt::Debug for AutomationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationSession")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("user_id", &self.user_id)
            .field("context_id", &self.context_id)
            .finish()
    }
}

type LedgerKey = (String, String);

/// 会话注册表
#[derive(Default)]
pub struct SessionRegistry {
    active: RwLock<HashMap<SessionId, Arc<AutomationSession>>>,
    bindings: RwLock<HashMap<ContextId, ContextBinding>>,
    tree: RwLock<HashMap<ContextId, ContextNode>>,
    ledger: RwLock<HashMap<LedgerKey, Vec<SubmittedLink>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_active(&self, session: Arc<AutomationSession>) {
        self.active.write().await.insert(session.id.clone(), session);
    }

    pub async fn get_active(&self, session_id: &str) -> Option<Arc<AutomationSession>> {
        self.active.read().await.get(session_id).cloned()
    }

    pub async fn remove_active(&self, session_id: &str) -> Option<Arc<AutomationSession>> {
        self.active.write().await.remove(session_id)
    }

    pub async fn active_sessions(&self) -> Vec<Arc<AutomationSession>> {
        self.active.read().await.values().cloned().collect()
    }

    /// 登记上下文（父子关系、初始 URL）
    pub async fn register_context(&self, context_id: ContextId, parent: Option<ContextId>, url: Option<String>) {
        self.tree.write().await.insert(
            context_id,
            ContextNode {
                parent,
                last_url: url,
            },
        );
    }

    /// 绑定上下文到会话；已归属其他会话时拒绝（先到先得）
    pub async fn bind(&self, context_id: ContextId, session_id: &str) -> Result<(), AutomationError> {
        let mut bindings = self.bindings.write().await;
        if let Some(existing) = bindings.get(&context_id) {
            if existing.session_id == session_id {
                return Ok(());
            }
            return Err(AutomationError::ContextConflict {
                context_id,
                session_id: existing.session_id.clone(),
            });
        }
        bindings.insert(
            context_id,
            ContextBinding {
                context_id,
                session_id: session_id.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub async fn binding(&self, context_id: ContextId) -> Option<ContextBinding> {
        self.bindings.read().await.get(&context_id).cloned()
    }

    pub async fn session_for(&self, context_id: ContextId) -> Option<SessionId> {
        self.binding(context_id).await.map(|b| b.session_id)
    }

    pub async fn contexts_of(&self, session_id: &str) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self
            .bindings
            .read()
            .await
            .values()
            .filter(|b| b.session_id == session_id)
            .map(|b| b.context_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn has_bindings(&self, session_id: &str) -> bool {
        self.bindings
            .read()
            .await
            .values()
            .any(|b| b.session_id == session_id)
    }

    /// 解除会话的全部绑定，返回被解除的上下文
    pub async fn unbind_session(&self, session_id: &str) -> Vec<ContextId> {
        let released: Vec<ContextId> = {
            let mut bindings = self.bindings.write().await;
            let ids: Vec<ContextId> = bindings
                .values()
                .filter(|b| b.session_id == session_id)
                .map(|b| b.context_id)
                .collect();
            for id in &ids {
                bindings.remove(id);
            }
            ids
        };
        if !released.is_empty() {
            tracing::debug!(%session_id, contexts = ?released, "contexts released");
        }
        released
    }

    /// 上下文被关闭：移除它及所有子上下文，返回被释放的绑定
    pub async fn release_context_tree(&self, root: ContextId) -> Vec<ContextBinding> {
        let closed: Vec<ContextId> = {
            let mut tree = self.tree.write().await;
            let mut closed = vec![root];
            let mut cursor = 0;
            while cursor < closed.len() {
                let current = closed[cursor];
                let mut children: Vec<ContextId> = tree
                    .iter()
                    .filter(|(_, node)| node.parent == Some(current))
                    .map(|(id, _)| *id)
                    .collect();
                children.sort_unstable();
                closed.extend(children);
                cursor += 1;
            }
            for id in &closed {
                tree.remove(id);
            }
            closed
        };

        let mut bindings = self.bindings.write().await;
        closed.iter().filter_map(|id| bindings.remove(id)).collect()
    }

    /// 会话结束后丢弃其上下文节点，避免树无限增长
    pub async fn forget_contexts(&self, ids: &[ContextId]) {
        if ids.is_empty() {
            return;
        }
        let mut tree = self.tree.write().await;
        for id in ids {
            tree.remove(id);
        }
    }

    /// 记录导航完成，返回上一次的 URL
    pub async fn record_navigation(&self, context_id: ContextId, url: &str) -> Option<String> {
        let mut tree = self.tree.write().await;
        let node = tree.entry(context_id).or_default();
        node.last_url.replace(url.to_string())
    }

    pub async fn parent_of(&self, context_id: ContextId) -> Option<ContextId> {
        self.tree.read().await.get(&context_id).and_then(|n| n.parent)
    }

    /// 该用户在该平台上的全部投递记录
    pub async fn ledger(&self, user_id: &str, platform: &str) -> Vec<SubmittedLink> {
        self.ledger
            .read()
            .await
            .get(&(user_id.to_string(), platform.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn record_submission(&self, user_id: &str, platform: &str, link: SubmittedLink) {
        self.ledger
            .write()
            .await
            .entry((user_id.to_string(), platform.to_string()))
            .or_default()
            .push(link);
    }

    /// 规范化 URL 是否已在记录中（任意状态）
    pub async fn ledger_contains(&self, user_id: &str, platform: &str, url: &str) -> bool {
        let key = normalize_url(url);
        self.ledger
            .read()
            .await
            .get(&(user_id.to_string(), platform.to_string()))
            .map(|links| links.iter().any(|l| normalize_url(&l.url) == key))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::recovery::RecoveryPolicy;
    use crate::platform::mock::{InMemoryBrowser, ScriptedAdapter};

    fn session(id: &str, context_id: ContextId, total: u32) -> AutomationSession {
        let context = SessionContext {
            session_id: id.into(),
            platform: "linkedin".into(),
            user_id: "u1".into(),
            user_profile: serde_json::Value::Null,
            session_config: SessionConfig {
                jobs_to_apply: total,
                ..SessionConfig::default()
            },
            api_host: String::new(),
            preferences: Default::default(),
        };
        let recovery = Arc::new(ErrorRecoveryEngine::new(
            Arc::new(InMemoryBrowser::new()),
            RecoveryPolicy::default(),
        ));
        AutomationSession::new(
            context,
            context_id,
            Arc::new(ScriptedAdapter::new("linkedin")),
            recovery,
            SessionStatus::Starting,
        )
    }

    #[tokio::test]
    async fn test_bind_first_writer_wins() {
        let registry = SessionRegistry::new();
        registry.bind(1, "s1").await.unwrap();
        registry.bind(1, "s1").await.unwrap();
        let err = registry.bind(1, "s2").await.unwrap_err();
        assert_eq!(
            err,
            AutomationError::ContextConflict {
                context_id: 1,
                session_id: "s1".into()
            }
        );
        assert_eq!(registry.session_for(1).await.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_release_context_tree() {
        let registry = SessionRegistry::new();
        registry.register_context(1, None, None).await;
        registry.register_context(2, Some(1), None).await;
        registry.register_context(3, Some(2), None).await;
        registry.register_context(4, None, None).await;
        registry.bind(1, "a").await.unwrap();
        registry.bind(3, "b").await.unwrap();
        registry.bind(4, "c").await.unwrap();

        let released = registry.release_context_tree(1).await;
        let mut sessions: Vec<_> = released.iter().map(|b| b.session_id.as_str()).collect();
        sessions.sort_unstable();
        assert_eq!(sessions, vec!["a", "b"]);
        assert!(!registry.has_bindings("a").await);
        assert!(registry.has_bindings("c").await);
        assert!(registry.release_context_tree(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_unbind_session() {
        let registry = SessionRegistry::new();
        registry.bind(1, "a").await.unwrap();
        registry.bind(2, "a").await.unwrap();
        registry.bind(3, "b").await.unwrap();
        assert_eq!(registry.contexts_of("a").await, vec![1, 2]);
        assert_eq!(registry.unbind_session("a").await.len(), 2);
        assert!(registry.contexts_of("a").await.is_empty());
        assert_eq!(registry.contexts_of("b").await, vec![3]);
    }

    #[tokio::test]
    async fn test_navigation_tracks_previous_url() {
        let registry = SessionRegistry::new();
        registry
            .register_context(1, None, Some("https://a.example".into()))
            .await;
        assert_eq!(
            registry.record_navigation(1, "https://b.example").await.as_deref(),
            Some("https://a.example")
        );
        assert_eq!(registry.record_navigation(9, "https://c.example").await, None);
    }

    #[tokio::test]
    async fn test_forget_contexts_drops_nodes_only() {
        let registry = SessionRegistry::new();
        registry.register_context(1, None, None).await;
        registry.register_context(2, Some(1), None).await;
        registry.bind(2, "b").await.unwrap();

        registry.forget_contexts(&[1, 2]).await;
        assert_eq!(registry.parent_of(2).await, None);
        // 绑定不受影响
        assert_eq!(registry.session_for(2).await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_ledger_is_scoped_by_user_and_platform() {
        let registry = SessionRegistry::new();
        registry
            .record_submission(
                "u1",
                "linkedin",
                SubmittedLink::new("https://jobs.example.com/1/", LinkStatus::Success, 0),
            )
            .await;
        assert!(registry.ledger_contains("u1", "linkedin", "https://JOBS.example.com/1").await);
        assert!(!registry.ledger_contains("u2", "linkedin", "https://jobs.example.com/1").await);
        assert!(!registry.ledger_contains("u1", "indeed", "https://jobs.example.com/1").await);
    }

    #[tokio::test]
    async fn test_transition_exactly_once() {
        let s = session("s1", 1, 2);
        assert_eq!(s.transition(SessionStatus::Running).await.unwrap(), SessionStatus::Starting);
        assert!(s.transition(SessionStatus::Stopped).await.is_ok());
        assert!(s.transition(SessionStatus::Stopped).await.is_err());
        assert_eq!(s.status().await, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_resolve_counts_dispatched_jobs_once() {
        let s = session("s1", 1, 2);
        assert!(s.try_dispatch("https://jobs.example.com/1").await);
        assert!(!s.try_dispatch("https://jobs.example.com/1/").await);

        let (counted, progress, _) = s.resolve("https://jobs.example.com/1", LinkStatus::Success).await;
        assert!(counted);
        assert_eq!(progress.completed, 1);
        assert!(progress.current.is_none());

        let (again, _, _) = s.resolve("https://jobs.example.com/1", LinkStatus::Failed).await;
        assert!(!again);
        let (stranger, _, _) = s.resolve("https://jobs.example.com/2", LinkStatus::Success).await;
        assert!(!stranger);
    }
}
