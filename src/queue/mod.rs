//! 职位队列：按会话维护的有序去重队列
//!
//! - **item**: JobQueueItem / SubmittedLink 数据模型
//! - **normalize**: normalize_url（去重键）
//! - **engine**: JobQueueEngine（build_queue / process_next / load_more）

mod engine;
mod item;
mod normalize;

pub use engine::{
    CompletionReason, DispatchError, JobDispatcher, JobQueueEngine, QueueStep, DEFAULT_BUFFER_THRESHOLD,
    DEFAULT_MAX_EMPTY_PAGES,
};
pub use item::{JobCandidate, JobQueueItem, LinkStatus, SubmittedLink};
pub use normalize::normalize_url;
