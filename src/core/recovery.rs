//! 错误恢复引擎
//!
//! 把适配器失败归类为 ErrorClass，再按尝试次数给出 RecoveryStrategy（动作 + 延时），
//! 超过上限返回 None，由调用方将该职位记为 FAILED。计数器按 (分类, 平台, 操作) 分桶，
//! 只能通过 reset 清零。每个会话一个引擎。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::{ContextId, ErrorClass, RecoveryAction};
use crate::platform::BrowserDriver;

const TIMEOUT_KEYWORDS: &[&str] = &["timeout", "timed out", "time out", "deadline exceeded"];

const NETWORK_KEYWORDS: &[&str] = &[
    "network",
    "net::err",
    "failed to fetch",
    "connection",
    "econnreset",
    "econnrefused",
    "dns",
    "offline",
    "socket",
    "502",
    "503",
    "504",
];

const ELEMENT_KEYWORDS: &[&str] = &[
    "element not found",
    "no such element",
    "not found",
    "selector",
    "queryselector",
    "not visible",
    "detached",
    "cannot read properties of null",
];

const FORM_KEYWORDS: &[&str] = &[
    "form",
    "validation",
    "required field",
    "invalid input",
    "invalid value",
    "field",
    "submit",
];

/// 重试参数
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    /// network：base + step * attempt（1s / 3s / 5s）
    pub network_base_delay: Duration,
    pub network_step_delay: Duration,
    pub element_delay: Duration,
    pub form_delay: Duration,
    pub timeout_delay: Duration,
    pub unknown_delay: Duration,
    pub page_load_timeout: Duration,
    pub element_timeout: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            network_base_delay: Duration::from_millis(1000),
            network_step_delay: Duration::from_millis(2000),
            element_delay: Duration::from_millis(2000),
            form_delay: Duration::from_millis(500),
            timeout_delay: Duration::from_millis(3000),
            unknown_delay: Duration::from_millis(1500),
            page_load_timeout: Duration::from_secs(30),
            element_timeout: Duration::from_secs(10),
        }
    }
}

/// 失败发生时的上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub platform: String,
    /// 失败时正在执行的操作（apply / find_jobs / ...）
    pub action: String,
    pub context_id: ContextId,
    pub selector: Option<String>,
    pub url: Option<String>,
}

impl ErrorContext {
    pub fn new(platform: impl Into<String>, action: impl Into<String>, context_id: ContextId) -> Self {
        Self {
            platform: platform.into(),
            action: action.into(),
            context_id,
            selector: None,
            url: None,
        }
    }

    pub fn with_selector(mut self, selector: Option<&str>) -> Self {
        self.selector = selector.map(str::to_string);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// 一次恢复的动作与延时
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStrategy {
    pub class: ErrorClass,
    pub action: RecoveryAction,
    pub delay: Duration,
    pub attempt: u32,
}

/// 恢复动作执行结果；执行失败不抛错
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub action: RecoveryAction,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AttemptKey {
    class: ErrorClass,
    platform: String,
    action: String,
}

impl AttemptKey {
    fn new(class: ErrorClass, ctx: &ErrorContext) -> Self {
        Self {
            class,
            platform: ctx.platform.clone(),
            action: ctx.action.clone(),
        }
    }
}

/// 按关键词归类；都不命中但带有选择器时视为元素缺失
pub fn classify(message: &str, ctx: &ErrorContext) -> ErrorClass {
    let lowered = message.to_lowercase();
    let hit = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

    if hit(TIMEOUT_KEYWORDS) {
        ErrorClass::Timeout
    } else if hit(NETWORK_KEYWORDS) {
        ErrorClass::Network
    } else if hit(ELEMENT_KEYWORDS) {
        ErrorClass::ElementNotFound
    } else if hit(FORM_KEYWORDS) {
        ErrorClass::Form
    } else if ctx.selector.is_some() {
        ErrorClass::ElementNotFound
    } else {
        ErrorClass::Unknown
    }
}

/// 会话级错误恢复引擎
pub struct ErrorRecoveryEngine {
    browser: Arc<dyn BrowserDriver>,
    policy: RecoveryPolicy,
    counters: Mutex<HashMap<AttemptKey, u32>>,
}

impl ErrorRecoveryEngine {
    pub fn new(browser: Arc<dyn BrowserDriver>, policy: RecoveryPolicy) -> Self {
        Self {
            browser,
            policy,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn classify(&self, message: &str, ctx: &ErrorContext) -> ErrorClass {
        classify(message, ctx)
    }

    /// attempt 从 0 开始；attempt ≥ max_retries 时不再给出策略
    pub fn decide(&self, class: ErrorClass, attempt: u32) -> Option<RecoveryStrategy> {
        if attempt >= self.policy.max_retries {
            return None;
        }
        let (action, delay) = match class {
            ErrorClass::Network => (
                RecoveryAction::ReloadPage,
                self.policy.network_base_delay + self.policy.network_step_delay * attempt,
            ),
            ErrorClass::ElementNotFound => (RecoveryAction::WaitForElement, self.policy.element_delay),
            ErrorClass::Form => (RecoveryAction::ClearAndRefill, self.policy.form_delay),
            ErrorClass::Timeout => (RecoveryAction::RefreshPage, self.policy.timeout_delay),
            ErrorClass::Unknown => (RecoveryAction::GenericRetry, self.policy.unknown_delay),
        };
        Some(RecoveryStrategy {
            class,
            action,
            delay,
            attempt,
        })
    }

    /// 当前计数
    pub fn attempts(&self, class: ErrorClass, ctx: &ErrorContext) -> u32 {
        self.counters
            .lock()
            .map(|c| c.get(&AttemptKey::new(class, ctx)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// 读取计数 → decide → 计数加一；返回 None 表示该职位应放弃
    pub fn next_strategy(&self, class: ErrorClass, ctx: &ErrorContext) -> Option<RecoveryStrategy> {
        let Ok(mut counters) = self.counters.lock() else {
            return None;
        };
        let counter = counters.entry(AttemptKey::new(class, ctx)).or_insert(0);
        let strategy = self.decide(class, *counter)?;
        *counter += 1;
        tracing::debug!(
            platform = %ctx.platform,
            action = %ctx.action,
            class = %class,
            attempt = strategy.attempt,
            recovery = %strategy.action,
            "recovery strategy chosen"
        );
        Some(strategy)
    }

    /// 在绑定的上下文上执行恢复动作；失败时把该分桶计数推到上限
    pub async fn execute(&self, strategy: &RecoveryStrategy, ctx: &ErrorContext) -> RecoveryOutcome {
        let result = match strategy.action {
            RecoveryAction::ReloadPage => self
                .browser
                .reload(ctx.context_id, false, self.policy.page_load_timeout)
                .await
                .map(|_| None),
            RecoveryAction::RefreshPage => self
                .browser
                .reload(ctx.context_id, true, self.policy.page_load_timeout)
                .await
                .map(|_| None),
            RecoveryAction::WaitForElement => {
                let selector = ctx.selector.as_deref().unwrap_or("body");
                match self
                    .browser
                    .wait_for_element(ctx.context_id, selector, self.policy.element_timeout)
                    .await
                {
                    Ok(true) => Ok(None),
                    Ok(false) => Ok(Some(format!("element {selector} did not appear"))),
                    Err(e) => Err(e),
                }
            }
            RecoveryAction::ClearAndRefill => {
                self.browser.clear_form(ctx.context_id).await.map(|_| None)
            }
            RecoveryAction::GenericRetry => Ok(None),
        };

        let outcome = match result {
            Ok(None) => RecoveryOutcome {
                success: true,
                action: strategy.action,
                detail: None,
            },
            Ok(Some(detail)) => RecoveryOutcome {
                success: false,
                action: strategy.action,
                detail: Some(detail),
            },
            Err(e) => RecoveryOutcome {
                success: false,
                action: strategy.action,
                detail: Some(e.to_string()),
            },
        };

        if !outcome.success {
            tracing::warn!(
                platform = %ctx.platform,
                recovery = %strategy.action,
                detail = ?outcome.detail,
                "recovery action failed, escalating"
            );
            if let Ok(mut counters) = self.counters.lock() {
                counters.insert(AttemptKey::new(strategy.class, ctx), self.policy.max_retries);
            }
        }
        outcome
    }

    /// 清空所有计数（会话停止或开始新职位时）
    pub fn reset(&self) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{DriverCall, InMemoryBrowser};

    fn ctx(context_id: ContextId) -> ErrorContext {
        ErrorContext::new("linkedin", "apply", context_id)
    }

    fn engine(browser: Arc<InMemoryBrowser>) -> ErrorRecoveryEngine {
        ErrorRecoveryEngine::new(browser, RecoveryPolicy::default())
    }

    #[test]
    fn test_classify_keywords() {
        let c = ctx(1);
        assert_eq!(classify("Navigation timed out after 30s", &c), ErrorClass::Timeout);
        assert_eq!(classify("net::ERR_CONNECTION_RESET", &c), ErrorClass::Network);
        assert_eq!(classify("No such element: .jobs-apply", &c), ErrorClass::ElementNotFound);
        assert_eq!(classify("Required field missing: phone", &c), ErrorClass::Form);
        assert_eq!(classify("something odd", &c), ErrorClass::Unknown);
        assert_eq!(
            classify("something odd", &c.clone().with_selector(Some("#submit"))),
            ErrorClass::ElementNotFound
        );
    }

    #[test]
    fn test_decide_schedule() {
        let engine = engine(Arc::new(InMemoryBrowser::new()));
        let first = engine.decide(ErrorClass::Network, 0).unwrap();
        assert_eq!(first.action, RecoveryAction::ReloadPage);
        assert_eq!(first.delay, Duration::from_millis(1000));
        assert_eq!(
            engine.decide(ErrorClass::Network, 1).unwrap().delay,
            Duration::from_millis(3000)
        );
        assert_eq!(
            engine.decide(ErrorClass::Network, 2).unwrap().delay,
            Duration::from_millis(5000)
        );
        assert!(engine.decide(ErrorClass::Network, 3).is_none());
        assert!(engine.decide(ErrorClass::Unknown, 10).is_none());

        assert_eq!(
            engine.decide(ErrorClass::ElementNotFound, 0).unwrap().action,
            RecoveryAction::WaitForElement
        );
        assert_eq!(
            engine.decide(ErrorClass::Form, 1).unwrap().action,
            RecoveryAction::ClearAndRefill
        );
        assert_eq!(
            engine.decide(ErrorClass::Timeout, 2).unwrap().action,
            RecoveryAction::RefreshPage
        );
    }

    #[test]
    fn test_counters_monotonic_until_reset() {
        let engine = engine(Arc::new(InMemoryBrowser::new()));
        let c = ctx(1);
        for expected in 0..3 {
            let strategy = engine.next_strategy(ErrorClass::Form, &c).unwrap();
            assert_eq!(strategy.attempt, expected);
        }
        assert!(engine.next_strategy(ErrorClass::Form, &c).is_none());
        assert_eq!(engine.attempts(ErrorClass::Form, &c), 3);

        // 分桶独立
        assert!(engine.next_strategy(ErrorClass::Network, &c).is_some());

        engine.reset();
        assert_eq!(engine.attempts(ErrorClass::Form, &c), 0);
        assert!(engine.next_strategy(ErrorClass::Form, &c).is_some());
    }

    #[tokio::test]
    async fn test_execute_runs_action_against_context() {
        let browser = Arc::new(InMemoryBrowser::new());
        let id = browser.open_context("https://example.com", None).await.unwrap();
        let engine = engine(browser.clone());
        let c = ctx(id);

        let strategy = engine.next_strategy(ErrorClass::Timeout, &c).unwrap();
        let outcome = engine.execute(&strategy, &c).await;
        assert!(outcome.success);
        assert!(browser.calls().contains(&DriverCall::Reload {
            context_id: id,
            ignore_cache: true
        }));
    }

    #[tokio::test]
    async fn test_failed_execution_escalates_bucket() {
        let browser = Arc::new(InMemoryBrowser::new());
        let id = browser.open_context("https://example.com", None).await.unwrap();
        browser.set_elements_present(false);
        let engine = engine(browser);
        let c = ctx(id).with_selector(Some(".apply-button"));

        let strategy = engine.next_strategy(ErrorClass::ElementNotFound, &c).unwrap();
        let outcome = engine.execute(&strategy, &c).await;
        assert!(!outcome.success);
        assert_eq!(outcome.action, RecoveryAction::WaitForElement);
        assert!(engine.next_strategy(ErrorClass::ElementNotFound, &c).is_none());
    }

    #[tokio::test]
    async fn test_execute_on_closed_context_never_errors() {
        let engine = engine(Arc::new(InMemoryBrowser::new()));
        let c = ctx(42);
        let strategy = engine.next_strategy(ErrorClass::Network, &c).unwrap();
        let outcome = engine.execute(&strategy, &c).await;
        assert!(!outcome.success);
        assert!(outcome.detail.unwrap().contains("closed"));
    }
}
