//! 编排器端到端集成测试（脚本化适配器 + 内存浏览器）

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use autoapply::config::AppConfig;
    use autoapply::core::{ContextId, SessionStatus};
    use autoapply::gateway::{ControlAction, ControlMessage, ControlResponse, Notification};
    use autoapply::platform::mock::{job_page, InMemoryBrowser, ScriptedAdapter};
    use autoapply::platform::{AdapterError, ApplyOutcome, BrowserDriver, PlatformAdapter, PlatformAdapterFactory};
    use autoapply::queue::LinkStatus;
    use autoapply::AutomationRuntime;
    use serde_json::json;
    use tokio::time::sleep;

    type Builder = Arc<dyn Fn() -> ScriptedAdapter + Send + Sync>;

    struct Harness {
        runtime: Arc<AutomationRuntime>,
        browser: Arc<InMemoryBrowser>,
        adapters: Arc<Mutex<Vec<Arc<ScriptedAdapter>>>>,
        events: Arc<Mutex<Vec<Notification>>>,
    }

    impl Harness {
        fn new(config: AppConfig, platforms: Vec<(&str, Builder)>) -> Self {
            let adapters: Arc<Mutex<Vec<Arc<ScriptedAdapter>>>> = Arc::new(Mutex::new(Vec::new()));
            let mut factory = PlatformAdapterFactory::new();
            for (name, build) in platforms {
                let created = adapters.clone();
                factory.register(name, move || -> Arc<dyn PlatformAdapter> {
                    let adapter = Arc::new(build());
                    created.lock().unwrap().push(adapter.clone());
                    adapter
                });
            }

            let browser = Arc::new(InMemoryBrowser::new());
            let runtime = Arc::new(AutomationRuntime::start(config, factory, browser.clone()));

            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = events.clone();
            let mut rx = runtime.subscribe();
            tokio::spawn(async move {
                while let Ok(notification) = rx.recv().await {
                    sink.lock().unwrap().push(notification);
                }
            });

            Self {
                runtime,
                browser,
                adapters,
                events,
            }
        }

        async fn start(&self, payload: serde_json::Value) -> ControlResponse {
            let request = ControlMessage::new(ControlAction::StartApplying).with_payload(&payload);
            self.runtime.handle(request).await
        }

        async fn control(&self, action: ControlAction, session_id: &str) -> ControlResponse {
            self.runtime
                .handle(ControlMessage::for_session(action, session_id))
                .await
        }

        fn events(&self) -> Vec<Notification> {
            self.events.lock().unwrap().clone()
        }

        fn adapter(&self, index: usize) -> Arc<ScriptedAdapter> {
            self.adapters.lock().unwrap()[index].clone()
        }

        fn dispatched(&self, session_id: &str) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|n| match n {
                    Notification::JobDispatched { session_id: id, url } if id == session_id => Some(url),
                    _ => None,
                })
                .collect()
        }

        fn transitions_to(&self, session_id: &str, status: SessionStatus) -> Vec<Option<String>> {
            self.events()
                .into_iter()
                .filter_map(|n| match n {
                    Notification::StatusChanged {
                        session_id: id,
                        to,
                        reason,
                        ..
                    } if id == session_id && to == status => Some(reason),
                    _ => None,
                })
                .collect()
        }

        fn finished(&self, session_id: &str) -> bool {
            self.events().iter().any(|n| {
                matches!(n, Notification::SessionFinished { session_id: id, .. } if id == session_id)
            })
        }
    }

    fn builder(f: impl Fn() -> ScriptedAdapter + Send + Sync + 'static) -> Builder {
        Arc::new(f)
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.router.port_reply_timeout_secs = 5;
        config.recovery.network_base_ms = 5;
        config.recovery.network_step_ms = 5;
        config.recovery.element_ms = 5;
        config.recovery.form_ms = 5;
        config.recovery.timeout_ms = 5;
        config.recovery.unknown_ms = 5;
        config
    }

    fn start_payload(platform: &str, jobs: i64) -> serde_json::Value {
        json!({
            "platform": platform,
            "userId": "user-1",
            "jobsToApply": jobs,
            "preferences": {"positions": ["Rust Engineer"]},
        })
    }

    async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    fn started(response: &ControlResponse) -> (String, ContextId) {
        assert_eq!(response.status.as_deref(), Some("started"), "{:?}", response);
        (
            response.session_id.clone().unwrap(),
            response.context_id.unwrap(),
        )
    }

    #[tokio::test]
    async fn test_session_applies_exactly_the_requested_number() {
        let h = Harness::new(
            fast_config(),
            vec![(
                "linkedin",
                builder(|| ScriptedAdapter::new("linkedin").with_pages(vec![job_page("li", 0..5)])),
            )],
        );

        let (session_id, _) = started(&h.start(start_payload("linkedin", 3)).await);
        assert!(wait_until(Duration::from_secs(5), || h.finished(&session_id)).await);

        let dispatched = h.dispatched(&session_id);
        assert_eq!(dispatched.len(), 3);
        let mut unique = dispatched.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);

        let status = h.control(ControlAction::GetStatus, &session_id).await;
        let session = status.session.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        let progress = status.progress.unwrap();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed, 3);
        assert_eq!(h.adapter(0).applied_urls().len(), 3);
        assert_eq!(h.transitions_to(&session_id, SessionStatus::Completed).len(), 1);

        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_session_skips_jobs_already_submitted() {
        let h = Harness::new(
            fast_config(),
            vec![(
                "linkedin",
                builder(|| ScriptedAdapter::new("linkedin").with_pages(vec![job_page("li", 0..3)])),
            )],
        );

        let (first, _) = started(&h.start(start_payload("linkedin", 2)).await);
        assert!(wait_until(Duration::from_secs(5), || h.finished(&first)).await);
        assert_eq!(h.adapter(0).applied_urls().len(), 2);

        let (second, _) = started(&h.start(start_payload("linkedin", 2)).await);
        assert!(wait_until(Duration::from_secs(5), || h.finished(&second)).await);

        let first_applied = h.adapter(0).applied_urls();
        let second_applied = h.adapter(1).applied_urls();
        assert_eq!(second_applied.len(), 1);
        assert!(!first_applied.contains(&second_applied[0]));

        let (session, progress) = h.runtime.orchestrator().status(&second).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(progress.completed, 1);

        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_resume_and_stop() {
        let h = Harness::new(
            fast_config(),
            vec![(
                "linkedin",
                builder(|| {
                    ScriptedAdapter::new("linkedin")
                        .with_pages(vec![job_page("li", 0..30)])
                        .with_apply_delay(Duration::from_millis(50))
                }),
            )],
        );

        let (session_id, _) = started(&h.start(start_payload("linkedin", 30)).await);
        assert!(
            wait_until(Duration::from_secs(5), || {
                !h.transitions_to(&session_id, SessionStatus::Running).is_empty()
            })
            .await
        );

        let paused = h.control(ControlAction::PauseApplying, &session_id).await;
        assert_eq!(paused.status.as_deref(), Some("paused"));
        let status = h.control(ControlAction::GetStatus, &session_id).await;
        assert_eq!(status.session.unwrap().status, SessionStatus::Paused);

        // 暂停前已派发的职位可以收尾，之后不再派发
        sleep(Duration::from_millis(200)).await;
        let while_paused = h.dispatched(&session_id).len();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(h.dispatched(&session_id).len(), while_paused);
        assert!(h.adapter(0).calls().iter().any(|c| c == "pause"));

        let resumed = h.control(ControlAction::ResumeApplying, &session_id).await;
        assert_eq!(resumed.status.as_deref(), Some("running"));
        assert!(
            wait_until(Duration::from_secs(5), || {
                h.dispatched(&session_id).len() > while_paused
            })
            .await
        );

        let stopped = h.control(ControlAction::StopApplying, &session_id).await;
        assert_eq!(stopped.status.as_deref(), Some("stopped"));
        assert!(wait_until(Duration::from_secs(2), || h.finished(&session_id)).await);

        let again = h.control(ControlAction::PauseApplying, &session_id).await;
        assert!(again.is_error());
        assert_eq!(again.code.as_deref(), Some("not_running"));

        let (session, _) = h.runtime.orchestrator().status(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);
        assert_eq!(h.transitions_to(&session_id, SessionStatus::Stopped).len(), 1);

        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_closing_shared_window_stops_both_sessions_once() {
        let slow = |platform: &'static str, prefix: &'static str| {
            builder(move || {
                ScriptedAdapter::new(platform)
                    .with_pages(vec![job_page(prefix, 0..30)])
                    .with_apply_delay(Duration::from_millis(50))
            })
        };
        let h = Harness::new(
            fast_config(),
            vec![("linkedin", slow("linkedin", "li")), ("indeed", slow("indeed", "in"))],
        );

        let (first, window) = started(&h.start(start_payload("linkedin", 30)).await);
        let mut payload = start_payload("indeed", 30);
        payload["window"] = json!(window);
        let (second, tab) = started(&h.start(payload).await);
        assert_ne!(window, tab);
        assert_eq!(
            h.runtime.orchestrator().registry().parent_of(tab).await,
            Some(window)
        );

        h.browser.close_externally(window);
        assert!(
            wait_until(Duration::from_secs(3), || h.finished(&first) && h.finished(&second)).await
        );
        sleep(Duration::from_millis(100)).await;

        for session_id in [&first, &second] {
            let stops = h.transitions_to(session_id, SessionStatus::Stopped);
            assert_eq!(stops, vec![Some("context closed".to_string())]);
            let (session, _) = h.runtime.orchestrator().status(session_id).await.unwrap();
            assert_eq!(session.status, SessionStatus::Stopped);
            assert_eq!(session.end_reason.as_deref(), Some("context closed"));
        }
        assert!(!h.runtime.orchestrator().registry().has_bindings(&first).await);
        assert!(!h.runtime.orchestrator().registry().has_bindings(&second).await);

        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected_while_first_in_flight() {
        let h = Harness::new(
            fast_config(),
            vec![(
                "linkedin",
                builder(|| ScriptedAdapter::new("linkedin").with_pages(vec![job_page("li", 0..2)])),
            )],
        );
        h.browser.pause_opens();

        let runtime = h.runtime.clone();
        let first = tokio::spawn(async move {
            let request = ControlMessage::new(ControlAction::StartApplying)
                .with_payload(&start_payload("linkedin", 1));
            runtime.handle(request).await
        });
        sleep(Duration::from_millis(50)).await;

        let second = h.start(start_payload("linkedin", 1)).await;
        assert!(second.is_error());
        assert_eq!(second.code.as_deref(), Some("duplicate_request"));

        h.browser.release_opens();
        let first = first.await.unwrap();
        let (session_id, _) = started(&first);
        assert!(wait_until(Duration::from_secs(5), || h.finished(&session_id)).await);
        assert_eq!(h.adapters.lock().unwrap().len(), 1);

        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_only_that_job() {
        let h = Harness::new(
            fast_config(),
            vec![(
                "linkedin",
                builder(|| {
                    ScriptedAdapter::new("linkedin")
                        .with_pages(vec![job_page("li", 0..5)])
                        .with_apply_results(
                            "https://jobs.example.com/li/1",
                            (0..4)
                                .map(|_| Err(AdapterError::element("#easy-apply", "element not found")))
                                .collect(),
                        )
                }),
            )],
        );

        let (session_id, context_id) = started(&h.start(start_payload("linkedin", 3)).await);
        assert!(wait_until(Duration::from_secs(5), || h.finished(&session_id)).await);

        let (session, progress) = h.runtime.orchestrator().status(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(progress.completed, 2);
        assert_eq!(progress.failed, 1);
        assert!(session
            .errors
            .iter()
            .any(|e| e.url.as_deref() == Some("https://jobs.example.com/li/1")));

        let applied = h.adapter(0).applied_urls();
        let attempts = applied
            .iter()
            .filter(|u| u.as_str() == "https://jobs.example.com/li/1")
            .count();
        assert_eq!(attempts, 4);

        let waits = h
            .browser
            .calls()
            .into_iter()
            .filter(|c| {
                matches!(c, autoapply::platform::mock::DriverCall::WaitForElement(id, sel)
                    if *id == context_id && sel == "#easy-apply")
            })
            .count();
        assert_eq!(waits, 3);

        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_popup_inherits_session_context() {
        let h = Harness::new(
            fast_config(),
            vec![(
                "linkedin",
                builder(|| {
                    ScriptedAdapter::new("linkedin")
                        .with_pages(vec![job_page("li", 0..30)])
                        .with_apply_delay(Duration::from_millis(50))
                }),
            )],
        );

        let (session_id, window) = started(&h.start(start_payload("linkedin", 30)).await);
        let popup = h.browser.open_popup(window, "https://jobs.example.com/li/0/apply");
        assert!(
            wait_until(Duration::from_secs(2), || {
                h.browser.injections(popup) == vec![session_id.clone()]
            })
            .await
        );
        let registry = h.runtime.orchestrator().registry();
        assert_eq!(registry.session_for(popup).await, Some(session_id.clone()));

        // 关闭弹窗不影响会话
        h.browser.close_externally(popup);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.session_for(popup).await, None);
        assert!(!h.finished(&session_id));
        assert_eq!(registry.contexts_of(&session_id).await, vec![window]);

        h.browser.close_externally(window);
        assert!(wait_until(Duration::from_secs(2), || h.finished(&session_id)).await);
        assert_eq!(
            h.transitions_to(&session_id, SessionStatus::Stopped),
            vec![Some("context closed".to_string())]
        );

        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsupported_platform_is_rejected() {
        let h = Harness::new(fast_config(), vec![]);
        let response = h.start(start_payload("monster", 1)).await;
        assert!(response.is_error());
        assert_eq!(response.code.as_deref(), Some("platform_unsupported"));

        let invalid = h.start(start_payload("linkedin", 0)).await;
        assert_eq!(invalid.code.as_deref(), Some("validation_error"));

        h.runtime.shutdown().await;
    }

    fn slow_linkedin() -> Builder {
        builder(|| {
            ScriptedAdapter::new("linkedin")
                .with_pages(vec![job_page("li", 0..30)])
                .with_apply_delay(Duration::from_millis(50))
        })
    }

    #[tokio::test]
    async fn test_load_more_failure_does_not_fail_session() {
        let h = Harness::new(
            fast_config(),
            vec![(
                "linkedin",
                builder(|| {
                    ScriptedAdapter::new("linkedin")
                        .with_pages(vec![job_page("li", 0..2)])
                        .with_load_more_results(vec![Err(AdapterError::failed(
                            "net::ERR_CONNECTION_RESET network error",
                        ))])
                }),
            )],
        );

        let (session_id, _) = started(&h.start(start_payload("linkedin", 2)).await);
        assert!(wait_until(Duration::from_secs(5), || h.finished(&session_id)).await);

        let (session, progress) = h.runtime.orchestrator().status(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(progress.completed, 2);
        assert!(session.errors.is_empty());
        assert!(h.transitions_to(&session_id, SessionStatus::Failed).is_empty());

        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_pagination_failures_end_queue_as_exhausted() {
        let h = Harness::new(
            fast_config(),
            vec![(
                "linkedin",
                builder(|| {
                    ScriptedAdapter::new("linkedin")
                        .with_pages(vec![job_page("li", 0..2), job_page("li", 2..4)])
                        .with_load_more_results(
                            (0..4)
                                .map(|_| Err(AdapterError::failed("net::ERR_CONNECTION_RESET network error")))
                                .collect(),
                        )
                }),
            )],
        );

        let (session_id, _) = started(&h.start(start_payload("linkedin", 4)).await);
        assert!(wait_until(Duration::from_secs(5), || h.finished(&session_id)).await);

        let (session, progress) = h.runtime.orchestrator().status(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.end_reason.as_deref(), Some("queue exhausted"));
        assert_eq!(progress.completed, 2);
        assert_eq!(h.adapter(0).applied_urls().len(), 2);

        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsupported_page_at_start_fails_session_once() {
        let h = Harness::new(
            fast_config(),
            vec![(
                "linkedin",
                builder(|| {
                    ScriptedAdapter::new("linkedin")
                        .with_pages(vec![job_page("li", 0..3)])
                        .with_start_error(AdapterError::Unsupported("captcha wall".into()))
                }),
            )],
        );

        let (session_id, _) = started(&h.start(start_payload("linkedin", 2)).await);
        assert!(wait_until(Duration::from_secs(5), || h.finished(&session_id)).await);

        let (session, progress) = h.runtime.orchestrator().status(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.errors.len(), 1);
        assert_eq!(session.errors[0].message, "captcha wall");
        assert!(session.errors[0].class.is_some());
        assert_eq!(progress.resolved(), 0);
        assert_eq!(h.transitions_to(&session_id, SessionStatus::Failed).len(), 1);
        assert!(h.adapter(0).applied_urls().is_empty());

        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsupported_apply_ends_session() {
        let h = Harness::new(
            fast_config(),
            vec![(
                "linkedin",
                builder(|| {
                    ScriptedAdapter::new("linkedin")
                        .with_pages(vec![job_page("li", 0..5)])
                        .with_apply_results(
                            "https://jobs.example.com/li/1",
                            vec![Err(AdapterError::Unsupported("application flow blocked".into()))],
                        )
                }),
            )],
        );

        let (session_id, _) = started(&h.start(start_payload("linkedin", 4)).await);
        assert!(wait_until(Duration::from_secs(5), || h.finished(&session_id)).await);

        let (session, progress) = h.runtime.orchestrator().status(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(session.errors.len(), 1);
        assert_eq!(session.errors[0].url.as_deref(), Some("https://jobs.example.com/li/1"));
        assert!(session.errors[0].class.is_some());
        // 致命错误后不再派发
        assert_eq!(h.dispatched(&session_id).len(), 2);

        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_already_applied_counts_as_skipped() {
        let h = Harness::new(
            fast_config(),
            vec![(
                "linkedin",
                builder(|| {
                    ScriptedAdapter::new("linkedin")
                        .with_pages(vec![job_page("li", 0..3)])
                        .with_apply_results(
                            "https://jobs.example.com/li/0",
                            vec![Ok(ApplyOutcome::AlreadyApplied)],
                        )
                }),
            )],
        );

        let (session_id, _) = started(&h.start(start_payload("linkedin", 2)).await);
        assert!(wait_until(Duration::from_secs(5), || h.finished(&session_id)).await);

        let (session, progress) = h.runtime.orchestrator().status(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(progress.skipped, 1);
        assert_eq!(progress.completed, 1);
        assert!(session.errors.is_empty());

        let ledger = h
            .runtime
            .orchestrator()
            .registry()
            .ledger("user-1", "linkedin")
            .await;
        let skipped = ledger
            .iter()
            .find(|l| l.url == "https://jobs.example.com/li/0")
            .unwrap();
        assert_eq!(skipped.status, LinkStatus::Skipped);

        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_navigation_reinjects_and_notifies_adapter() {
        let h = Harness::new(fast_config(), vec![("linkedin", slow_linkedin())]);
        let (session_id, window) = started(&h.start(start_payload("linkedin", 30)).await);
        assert_eq!(h.browser.injections(window).len(), 1);

        h.browser
            .navigate_externally(window, "https://jobs.example.com/li/0/apply");
        assert!(
            wait_until(Duration::from_secs(2), || h.browser.injections(window).len() == 2).await
        );
        assert!(
            wait_until(Duration::from_secs(2), || {
                h.adapter(0).calls().iter().any(|c| c == "on_navigation")
            })
            .await
        );

        h.browser.dom_change(window);
        assert!(
            wait_until(Duration::from_secs(2), || {
                h.adapter(0).calls().iter().any(|c| c == "on_dom_change")
            })
            .await
        );

        // 未绑定的上下文事件被忽略
        let stranger = h.browser.open_context("https://example.com", None).await.unwrap();
        h.browser.navigate_externally(stranger, "https://example.com/next");
        sleep(Duration::from_millis(100)).await;
        assert!(h.browser.injections(stranger).is_empty());

        h.control(ControlAction::StopApplying, &session_id).await;
        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_content_script_ready_and_application_submitted() {
        let h = Harness::new(fast_config(), vec![("linkedin", slow_linkedin())]);
        let (session_id, window) = started(&h.start(start_payload("linkedin", 30)).await);

        let ready = h
            .runtime
            .handle(
                ControlMessage::for_session(ControlAction::ContentScriptReady, session_id.clone())
                    .with_payload(&json!({
                        "sessionContext": {"sessionId": session_id, "platform": "linkedin", "userId": "user-1"}
                    })),
            )
            .await;
        assert_eq!(ready.success, Some(true), "{:?}", ready);
        assert_eq!(ready.context_id, Some(window));
        assert_eq!(h.browser.injections(window).len(), 2);

        let stale = h
            .runtime
            .handle(
                ControlMessage::for_session(ControlAction::ContentScriptReady, session_id.clone())
                    .with_payload(&json!({
                        "sessionContext": {"sessionId": "old-session", "platform": "linkedin", "userId": "user-1"}
                    })),
            )
            .await;
        assert_eq!(stale.code.as_deref(), Some("validation_error"));

        let malformed = h
            .runtime
            .handle(
                ControlMessage::for_session(ControlAction::ContentScriptReady, session_id.clone())
                    .with_payload(&json!({ "sessionContext": {"platform": "linkedin"} })),
            )
            .await;
        assert_eq!(malformed.code.as_deref(), Some("validation_error"));
        assert_eq!(h.browser.injections(window).len(), 2);

        let external = "https://jobs.example.com/li/external";
        let submitted = h
            .runtime
            .handle(
                ControlMessage::for_session(ControlAction::ApplicationSubmitted, session_id.clone())
                    .with_payload(&json!({
                        "jobData": {"url": external},
                        "applicationData": {"confirmation": "A-1"},
                    })),
            )
            .await;
        assert_eq!(submitted.success, Some(true), "{:?}", submitted);
        let registry = h.runtime.orchestrator().registry();
        assert!(registry.ledger_contains("user-1", "linkedin", external).await);

        let missing = h
            .runtime
            .handle(ControlMessage::for_session(ControlAction::ApplicationSubmitted, session_id.clone()))
            .await;
        assert_eq!(missing.code.as_deref(), Some("validation_error"));

        h.control(ControlAction::StopApplying, &session_id).await;
        h.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_closing_primary_stops_session_despite_other_bindings() {
        let h = Harness::new(fast_config(), vec![("linkedin", slow_linkedin())]);
        let (session_id, window) = started(&h.start(start_payload("linkedin", 30)).await);

        // 不在主窗口子树里的另一个上下文
        let extra = h.browser.open_context("https://jobs.example.com/li/7", None).await.unwrap();
        let registry = h.runtime.orchestrator().registry();
        registry.register_context(extra, None, None).await;
        registry.bind(extra, &session_id).await.unwrap();
        assert_eq!(registry.contexts_of(&session_id).await, vec![window, extra]);

        h.browser.close_externally(window);
        assert!(wait_until(Duration::from_secs(2), || h.finished(&session_id)).await);
        assert_eq!(
            h.transitions_to(&session_id, SessionStatus::Stopped),
            vec![Some("context closed".to_string())]
        );
        assert!(h.browser.is_open(extra));
        assert_eq!(registry.session_for(extra).await, None);

        h.runtime.shutdown().await;
    }
}
