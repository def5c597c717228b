//! PortChannel：每个浏览上下文一条长连接
//!
//! 端口名编码平台（`autoapply:{platform}:{context_id}`），入站消息据此直接路由到对应平台，
//! 无需逐条查表。所有入站消息汇入同一个 mpsc，由 MessageRouter 顺序处理；
//! 出站按上下文分别投递，单通道内 FIFO。

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::mpsc;

use super::message::PortMessage;
use crate::core::{AutomationError, ContextId, SessionId};

const PORT_PREFIX: &str = "autoapply";

/// 端口名
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortName {
    pub platform: String,
    pub context_id: ContextId,
}

impl PortName {
    pub fn new(platform: impl Into<String>, context_id: ContextId) -> Self {
        Self {
            platform: platform.into(),
            context_id,
        }
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PORT_PREFIX}:{}:{}", self.platform, self.context_id)
    }
}

/// 入站消息：来自哪个端口
#[derive(Debug, Clone)]
pub struct Inbound {
    pub port: PortName,
    pub message: PortMessage,
}

struct PortEntry {
    platform: String,
    session_id: SessionId,
    tx: mpsc::UnboundedSender<PortMessage>,
}

/// 端口注册表（控制端）
pub struct PortRegistry {
    ports: RwLock<HashMap<ContextId, PortEntry>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
}

impl PortRegistry {
    /// 返回注册表与汇总的入站接收端
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                ports: RwLock::new(HashMap::new()),
                inbound_tx,
            },
            inbound_rx,
        )
    }

    /// 为上下文建立端口，返回 worker 一端；同一上下文重复连接会替换旧端口
    pub fn connect(&self, name: PortName, session_id: impl Into<SessionId>) -> WorkerPort {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = session_id.into();
        if let Ok(mut ports) = self.ports.write() {
            ports.insert(
                name.context_id,
                PortEntry {
                    platform: name.platform.clone(),
                    session_id: session_id.clone(),
                    tx,
                },
            );
        }
        tracing::debug!(port = %name, %session_id, "port connected");
        WorkerPort {
            sender: PortSender {
                name,
                inbound: self.inbound_tx.clone(),
            },
            rx,
        }
    }

    /// 向上下文投递（发后即忘，至多一次）
    pub fn send(&self, context_id: ContextId, message: PortMessage) -> Result<(), AutomationError> {
        let ports = self
            .ports
            .read()
            .map_err(|e| AutomationError::ChannelClosed(e.to_string()))?;
        let entry = ports.get(&context_id).ok_or_else(|| {
            AutomationError::ChannelClosed(format!("no port for context {context_id}"))
        })?;
        entry
            .tx
            .send(message)
            .map_err(|_| AutomationError::ChannelClosed(format!("port {context_id} disconnected")))
    }

    /// 入站消息的归属会话：端口名中的平台须与连接时一致，否则视为陈旧端口
    pub fn route(&self, name: &PortName) -> Option<SessionId> {
        let ports = self.ports.read().ok()?;
        let entry = ports.get(&name.context_id)?;
        if entry.platform != name.platform {
            tracing::warn!(port = %name, expected = %entry.platform, "port platform mismatch");
            return None;
        }
        Some(entry.session_id.clone())
    }

    /// 断开端口；worker 端随后收到 None
    pub fn disconnect(&self, context_id: ContextId) -> bool {
        let removed = self
            .ports
            .write()
            .map(|mut p| p.remove(&context_id).is_some())
            .unwrap_or(false);
        if removed {
            tracing::debug!(context_id, "port disconnected");
        }
        removed
    }
}

/// worker 一端的发送句柄，可克隆
#[derive(Debug, Clone)]
pub struct PortSender {
    name: PortName,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl PortSender {
    /// 发往控制端
    pub fn post(&self, message: PortMessage) -> Result<(), AutomationError> {
        self.inbound
            .send(Inbound {
                port: self.name.clone(),
                message,
            })
            .map_err(|_| AutomationError::ChannelClosed(format!("router for {} is gone", self.name)))
    }
}

/// worker 一端
pub struct WorkerPort {
    sender: PortSender,
    rx: mpsc::UnboundedReceiver<PortMessage>,
}

impl WorkerPort {
    pub fn name(&self) -> &PortName {
        &self.sender.name
    }

    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    pub fn post(&self, message: PortMessage) -> Result<(), AutomationError> {
        self.sender.post(message)
    }

    /// 端口断开后返回 None
    pub async fn recv(&mut self) -> Option<PortMessage> {
        self.rx.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<PortMessage, AutomationError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(AutomationError::ChannelClosed(format!(
                "port {} disconnected",
                self.sender.name
            ))),
            Err(_) => Err(AutomationError::Timeout(format!(
                "no reply on {} within {:?}",
                self.sender.name, timeout
            ))),
        }
    }
}
