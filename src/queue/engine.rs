//! 单会话职位队列
//!
//! 核心功能：
//! - build_queue：提取当前页职位，按规范化 URL 过滤已投递 / 已入队的，按页面顺序追加
//! - process_next：上限检查 → 必要时预加载下一页 → 取下一个未见过的职位派发
//! - load_more：翻页后按 URL 差分，只追加新职位，游标不动
//!
//! 调用方须在上一个职位终结（record_outcome）之后再调用 process_next。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::{AutomationError, Progress};
use crate::platform::{AdapterError, PlatformAdapter};
use crate::queue::{normalize_url, JobCandidate, JobQueueItem, LinkStatus, SubmittedLink};

/// 默认预加载阈值：剩余未处理职位少于该值时翻页
pub const DEFAULT_BUFFER_THRESHOLD: usize = 3;

/// 默认连续空页上限：翻页连续这么多次都没有新职位即视为没有更多
pub const DEFAULT_MAX_EMPTY_PAGES: u32 = 3;

/// 队列终结原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// 已达到 jobs_to_apply
    LimitReached,
    /// 队列耗尽且没有更多页
    Exhausted,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::LimitReached => "limit reached",
            CompletionReason::Exhausted => "queue exhausted",
        }
    }
}

/// process_next 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum QueueStep {
    /// 已派发 START_APPLICATION
    Dispatched(JobQueueItem),
    /// 应发送 SEARCH_COMPLETED
    Completed(CompletionReason),
}

/// 派发失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// 本条被拒绝，记为 FAILED 后继续下一条
    Rejected(String),
    /// 通道已断开，整个队列无法继续
    Disconnected,
}

/// 派发 START_APPLICATION 的出口（通常是会话的 PortChannel）
pub trait JobDispatcher: Send {
    fn dispatch(&mut self, item: &JobQueueItem) -> Result<(), DispatchError>;
}

/// 单会话职位队列
pub struct JobQueueEngine {
    adapter: Arc<dyn PlatformAdapter>,
    limit: u32,
    buffer_threshold: usize,
    max_empty_pages: u32,
    items: Vec<JobQueueItem>,
    cursor: usize,
    /// 已入队的规范化 URL
    queued: HashSet<String>,
    /// 只追加的投递记录
    submitted: Vec<SubmittedLink>,
    /// 规范化 URL → submitted 中最后一条的下标
    submitted_index: HashMap<String, usize>,
    dispatched: HashSet<String>,
    resolved: HashSet<String>,
    progress: Progress,
    pages_exhausted: bool,
    empty_pages: u32,
}

impl JobQueueEngine {
    /// history 为此前（含其他会话）的投递记录，只参与去重，不计入本会话进度
    pub fn new(adapter: Arc<dyn PlatformAdapter>, limit: u32, history: Vec<SubmittedLink>) -> Self {
        let mut engine = Self {
            adapter,
            limit,
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            max_empty_pages: DEFAULT_MAX_EMPTY_PAGES,
            items: Vec::new(),
            cursor: 0,
            queued: HashSet::new(),
            submitted: Vec::new(),
            submitted_index: HashMap::new(),
            dispatched: HashSet::new(),
            resolved: HashSet::new(),
            progress: Progress::new(limit),
            pages_exhausted: false,
            empty_pages: 0,
        };
        for link in history {
            engine.append_submitted(link);
        }
        engine
    }

    pub fn with_buffer_threshold(mut self, threshold: usize) -> Self {
        self.buffer_threshold = threshold;
        self
    }

    pub fn with_max_empty_pages(mut self, pages: u32) -> Self {
        self.max_empty_pages = pages.max(1);
        self
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn items(&self) -> &[JobQueueItem] {
        &self.items
    }

    pub fn submitted(&self) -> &[SubmittedLink] {
        &self.submitted
    }

    /// 尚未处理的职位数
    pub fn remaining(&self) -> usize {
        self.items.len().saturating_sub(self.cursor)
    }

    pub fn is_submitted(&self, url: &str) -> bool {
        self.submitted_index.contains_key(&normalize_url(url))
    }

    /// 提取当前页职位并入队，返回新增数量
    pub async fn build_queue(&mut self) -> Result<usize, AutomationError> {
        let candidates = self
            .adapter
            .find_jobs()
            .await
            .map_err(|e| discovery_error("find_jobs", e))?;
        let found = candidates.len();
        let added = self.append_novel(candidates);
        tracing::info!(
            platform = %self.adapter.platform(),
            found,
            added,
            "job queue built"
        );
        Ok(added)
    }

    /// 翻页并追加新职位，返回新增数量；没有更多页时返回 0
    pub async fn load_more(&mut self) -> Result<usize, AutomationError> {
        if self.pages_exhausted {
            return Ok(0);
        }
        let more = self
            .adapter
            .load_more()
            .await
            .map_err(|e| discovery_error("load_more", e))?;
        if !more {
            tracing::debug!(platform = %self.adapter.platform(), "no more pages");
            self.pages_exhausted = true;
            return Ok(0);
        }
        let candidates = self
            .adapter
            .find_jobs()
            .await
            .map_err(|e| discovery_error("find_jobs", e))?;
        let added = self.append_novel(candidates);
        if added == 0 {
            self.empty_pages += 1;
            if self.empty_pages >= self.max_empty_pages {
                tracing::debug!(
                    platform = %self.adapter.platform(),
                    empty_pages = self.empty_pages,
                    "pagination yields nothing new, treating as exhausted"
                );
                self.pages_exhausted = true;
            }
        } else {
            self.empty_pages = 0;
        }
        tracing::debug!(added, queued = self.items.len(), cursor = self.cursor, "page loaded");
        Ok(added)
    }

    /// 放弃翻页：之后队列取完即以 Exhausted 终结
    pub fn mark_exhausted(&mut self) {
        if !self.pages_exhausted {
            tracing::debug!(platform = %self.adapter.platform(), "pagination abandoned");
        }
        self.pages_exhausted = true;
    }

    /// 取下一个未见过的职位并派发
    pub async fn process_next(
        &mut self,
        dispatcher: &mut dyn JobDispatcher,
    ) -> Result<QueueStep, AutomationError> {
        loop {
            if self.progress.is_limit_reached() {
                return Ok(QueueStep::Completed(CompletionReason::LimitReached));
            }

            if self.remaining() < self.buffer_threshold && !self.pages_exhausted {
                self.load_more().await?;
            }

            let Some(item) = self.items.get(self.cursor).cloned() else {
                if self.pages_exhausted {
                    return Ok(QueueStep::Completed(CompletionReason::Exhausted));
                }
                self.load_more().await?;
                continue;
            };
            self.cursor += 1;

            let key = normalize_url(&item.url);
            if self.dispatched.contains(&key) || self.submitted_index.contains_key(&key) {
                continue;
            }

            match dispatcher.dispatch(&item) {
                Ok(()) => {
                    self.dispatched.insert(key);
                    self.progress.current = Some(item.url.clone());
                    return Ok(QueueStep::Dispatched(item));
                }
                Err(DispatchError::Rejected(reason)) => {
                    tracing::warn!(url = %item.url, %reason, "dispatch rejected, skipping to next job");
                    self.dispatched.insert(key);
                    self.record_outcome(&item.url, LinkStatus::Failed, 0);
                }
                Err(DispatchError::Disconnected) => {
                    return Err(AutomationError::ChannelClosed(format!(
                        "dispatch of {} failed",
                        item.url
                    )));
                }
            }
        }
    }

    /// 记录职位终结结果；只有本会话派发过且尚未终结的职位计入进度
    pub fn record_outcome(&mut self, url: &str, status: LinkStatus, tries: u32) -> bool {
        let key = normalize_url(url);
        self.append_submitted(SubmittedLink::new(url, status, tries));
        if !self.dispatched.contains(&key) || !self.resolved.insert(key) {
            return false;
        }
        if self.progress.current.as_deref() == Some(url) {
            self.progress.current = None;
        }
        self.progress.record(status)
    }

    fn append_submitted(&mut self, link: SubmittedLink) {
        let key = normalize_url(&link.url);
        self.submitted.push(link);
        self.submitted_index.insert(key, self.submitted.len() - 1);
    }

    fn append_novel(&mut self, candidates: Vec<JobCandidate>) -> usize {
        let mut added = 0;
        for candidate in candidates {
            let key = normalize_url(&candidate.url);
            if key.is_empty()
                || self.queued.contains(&key)
                || self.submitted_index.contains_key(&key)
            {
                continue;
            }
            self.queued.insert(key);
            let index = self.items.len();
            self.items.push(JobQueueItem::from_candidate(candidate, index));
            added += 1;
        }
        added
    }
}

/// 不支持 / 取消保持原语义，其余发现失败交给调用方走恢复流程
fn discovery_error(operation: &str, err: AdapterError) -> AutomationError {
    match err {
        AdapterError::Unsupported(_) | AdapterError::Cancelled => err.into(),
        other => AutomationError::Discovery {
            operation: operation.to_string(),
            message: other.to_string(),
        },
    }
}
