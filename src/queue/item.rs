//! 队列数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 适配器从当前页面提取到的候选职位（尚未入队）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobCandidate {
    pub url: String,
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub compensation: Option<String>,
}

impl JobCandidate {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// 已入队职位；创建后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobQueueItem {
    pub url: String,
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub compensation: Option<String>,
    /// 入队顺序（FIFO）
    pub queue_index: usize,
    pub extracted_at: DateTime<Utc>,
}

impl JobQueueItem {
    pub fn from_candidate(candidate: JobCandidate, queue_index: usize) -> Self {
        Self {
            url: candidate.url,
            title: candidate.title,
            company: candidate.company,
            location: candidate.location,
            compensation: candidate.compensation,
            queue_index,
            extracted_at: Utc::now(),
        }
    }
}

/// 投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Success,
    Failed,
    Skipped,
}

/// 已尝试过的链接（只追加），用于去重
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedLink {
    pub url: String,
    pub status: LinkStatus,
    pub timestamp: DateTime<Utc>,
    /// 同一 URL 的重试次数；首次尝试不计
    pub tries: u32,
}

impl SubmittedLink {
    pub fn new(url: impl Into<String>, status: LinkStatus, tries: u32) -> Self {
        Self {
            url: url.into(),
            status,
            timestamp: Utc::now(),
            tries,
        }
    }
}
