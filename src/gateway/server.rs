//! 控制面 WebSocket 服务
//!
//! 每条连接：文本帧解析为 ControlMessage 交给 MessageRouter，响应带回请求里的 requestId；
//! 同时把会话通知原样推给所有连接。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::message::{ControlMessage, ControlResponse, Notification};
use super::router::MessageRouter;
use crate::config::GatewaySection;
use crate::core::AutomationError;

/// WebSocket 控制面服务
pub struct ControlServer {
    config: GatewaySection,
    router: Arc<MessageRouter>,
    connections: Arc<AtomicUsize>,
}

impl ControlServer {
    pub fn new(config: GatewaySection, router: Arc<MessageRouter>) -> Self {
        Self {
            config,
            router,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// 监听直到 shutdown 被触发
    pub async fn serve(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr: SocketAddr = self.config.bind_addr.parse()?;
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("Control gateway listening on ws://{}", addr);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        if self.connection_count() >= self.config.max_connections {
                            tracing::warn!("Connection limit reached, rejecting {}", peer);
                            continue;
                        }
                        let router = Arc::clone(&self.router);
                        let connections = Arc::clone(&self.connections);
                        let shutdown = shutdown.clone();
                        connections.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, router, shutdown).await {
                                tracing::error!("Connection error from {}: {}", peer, e);
                            }
                            connections.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
            }
        }
        tracing::info!("Control gateway stopped");
        Ok(())
    }
}

/// 解析一帧；requestId 为可选的关联字段
fn parse_frame(text: &str) -> (Option<Value>, Result<ControlMessage, AutomationError>) {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return (None, Err(AutomationError::Validation(format!("invalid json: {e}")))),
    };
    let request_id = raw.get("requestId").cloned();
    let message = serde_json::from_value(raw)
        .map_err(|e| AutomationError::Validation(format!("invalid control message: {e}")));
    (request_id, message)
}

fn response_frame(request_id: Option<Value>, response: &ControlResponse) -> String {
    json!({
        "type": "response",
        "requestId": request_id,
        "response": response,
    })
    .to_string()
}

fn notification_frame(notification: &Notification) -> String {
    json!({ "type": "notification", "notification": notification }).to_string()
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tracing::info!("New control connection from {}", peer);

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut notifications = router.orchestrator().subscribe();
    let notify_tx = tx.clone();
    let forward = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(n) => {
                    if notify_tx.send(notification_frame(&n)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Notification stream lagged by {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let Some(frame) = frame else { break };
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("WebSocket receive error: {}", e);
                break;
            }
        };
        match frame {
            WsMessage::Text(text) => {
                let (request_id, message) = parse_frame(&text);
                match message {
                    Ok(message) => {
                        let router = Arc::clone(&router);
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let response = router.handle_control(message).await;
                            let _ = tx.send(response_frame(request_id, &response));
                        });
                    }
                    Err(e) => {
                        let _ = tx.send(response_frame(request_id, &ControlResponse::error(&e)));
                    }
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    forward.abort();
    tracing::info!("Control connection closed: {}", peer);
    Ok(())
}
