//! 会话网关：消息协议、会话存储、端口、注册表与路由
//!
//! ## 控制面
//!
//! 请求 / 响应式的 ControlMessage（startApplying、pauseApplying、getStatus ...），
//! 由 MessageRouter 并发处理；同一用户同一平台的同一动作同时只允许一个在途。
//!
//! ## 数据面
//!
//! 每个浏览上下文一条 PortChannel，worker 与控制端在上面交换有序的 PortMessage
//! （GET_SEARCH_TASK → SEARCH_TASK_DATA → START_APPLICATION → ...）。
//!
//! ## 上下文事件
//!
//! 浏览器驱动广播的 ContextEvent：子窗口继承父窗口的会话，导航后重新注入上下文，
//! 窗口关闭时释放整棵子树并停止受影响的会话。

pub mod message;
pub mod port;
pub mod registry;
pub mod router;
pub mod runtime;
#[cfg(feature = "gateway")]
pub mod server;
pub mod session;
pub mod session_store;

pub use message::{
    ControlAction, ControlMessage, ControlResponse, Notification, PortMessage, PortMessageType,
    SessionContext,
};
pub use port::{Inbound, PortName, PortRegistry, WorkerPort};
pub use registry::{AutomationSession, ContextBinding, SessionRegistry};
pub use router::MessageRouter;
pub use runtime::AutomationRuntime;
#[cfg(feature = "gateway")]
pub use server::ControlServer;
pub use session::{NewSession, Session, SessionConfig, SessionFilter, SessionPatch};
pub use session_store::{create_session_store, MemorySessionStore, SessionStore};
