//! 流式进度监听 - 业务能力层
//!
//! 订阅 ComfyUI 的 WebSocket 通道，把原始消息翻译成任务进度事件。
//!
//! ## 协议
//!
//! - 文本帧是 JSON，按 `type` 字段分类：`status` / `progress` /
//!   `executing` / `executed` / `execution_error`
//! - `executing` 且 `node` 为 null 且任务 ID 匹配，表示任务完成
//! - 二进制帧是预览图：前 8 字节为帧头，其余为图像数据
//!
//! ## 重连
//!
//! 通道异常关闭或空闲超时按退避策略重连（基础间隔逐次翻倍），
//! 任务正常完成后不再重连。

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::StreamError;

/// 预览帧的头部长度（事件类型 + 图像格式，各 4 字节）
const PREVIEW_HEADER_LEN: usize = 8;

/// 任务进度事件
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// 队列状态更新
    Queued { remaining: u64 },
    /// 节点开始执行
    NodeStarted { node_id: String },
    /// 节点执行完毕并产出结果
    NodeFinished { node_id: String },
    /// 当前节点的进度
    Progress { value: u64, max: u64 },
    /// 预览图帧（已剥离帧头）
    Preview(Vec<u8>),
    /// 任务执行完成
    Completed,
}

/// 监听结束的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    /// 任务正常完成
    Completed,
    /// 收到取消信号，主动退出
    Cancelled,
}

/// 流式通道收到的单条消息
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// 流式通道连接
///
/// `next_message` 返回 `Ok(None)` 表示通道被对端关闭。
#[async_trait]
pub trait StreamConnection: Send {
    async fn next_message(&mut self) -> Result<Option<StreamMessage>, StreamError>;
}

/// 流式通道传输层
///
/// 把"建立连接"抽象出来，测试中可以用脚本化的假通道
/// 驱动重连逻辑，不需要真实的 WebSocket 服务。
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>, StreamError>;
}

/// 基于 tokio-tungstenite 的真实 WebSocket 传输层
pub struct WsTransport;

#[async_trait]
impl StreamTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>, StreamError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| StreamError::ConnectFailed {
                url: url.to_string(),
                source: Box::new(e),
            })?;
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl StreamConnection for WsConnection {
    async fn next_message(&mut self) -> Result<Option<StreamMessage>, StreamError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(StreamMessage::Text(text.to_string())))
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(StreamMessage::Binary(data.to_vec())))
                }
                Some(Ok(Message::Ping(payload))) => {
                    // tungstenite 会自动排队 Pong，这里只需要冲刷
                    let _ = self.stream.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => {
                    return Err(StreamError::ClosedAbnormally {
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

/// 流式进度监听器
pub struct ProgressListener<'a> {
    transport: &'a dyn StreamTransport,
    ws_url: String,
    retry_budget: u32,
    backoff_base: Duration,
    idle_timeout: Duration,
}

impl<'a> ProgressListener<'a> {
    pub fn new(config: &Config, transport: &'a dyn StreamTransport) -> Self {
        Self {
            transport,
            ws_url: config.ws_url(),
            retry_budget: config.stream_retry_budget,
            backoff_base: Duration::from_secs(config.stream_backoff_base_secs),
            idle_timeout: Duration::from_secs(config.stream_idle_timeout_secs),
        }
    }

    /// 监听单个任务直到完成、取消或失败
    ///
    /// 每个进度事件通过 `on_event` 回调转发给调用方。
    /// 通道异常关闭或空闲超时会按退避策略重连，
    /// 超出重连预算后返回错误。
    pub async fn listen(
        &self,
        prompt_id: &str,
        client_id: &str,
        cancel: &mut watch::Receiver<bool>,
        mut on_event: impl FnMut(ProgressEvent) + Send,
    ) -> Result<ListenOutcome, StreamError> {
        let url = format!("{}?clientId={}", self.ws_url, client_id);
        let mut attempts: u32 = 0;

        loop {
            if *cancel.borrow() {
                info!("收到取消信号，停止监听任务 {}", prompt_id);
                return Ok(ListenOutcome::Cancelled);
            }

            let connect_result = tokio::select! {
                result = self.transport.connect(&url) => result,
                _ = cancel.changed() => {
                    info!("收到取消信号，停止监听任务 {}", prompt_id);
                    return Ok(ListenOutcome::Cancelled);
                }
            };

            let failure = match connect_result {
                Ok(mut conn) => {
                    debug!("流式通道已建立: {}", url);
                    match self
                        .read_until_done(conn.as_mut(), prompt_id, cancel, &mut on_event)
                        .await?
                    {
                        ReadResult::Completed => return Ok(ListenOutcome::Completed),
                        ReadResult::Cancelled => return Ok(ListenOutcome::Cancelled),
                        ReadResult::Disconnected(reason) => reason,
                    }
                }
                Err(e) => e.to_string(),
            };

            attempts += 1;
            if attempts > self.retry_budget {
                return Err(StreamError::RetryBudgetExhausted {
                    attempts: attempts - 1,
                    last: failure,
                });
            }

            let backoff = self.backoff_base * 2u32.saturating_pow(attempts - 1);
            warn!(
                "⚠️ 流式通道中断 ({})，{} 秒后重连 (第 {}/{} 次)",
                failure,
                backoff.as_secs(),
                attempts,
                self.retry_budget
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.changed() => {
                    info!("收到取消信号，停止监听任务 {}", prompt_id);
                    return Ok(ListenOutcome::Cancelled);
                }
            }
        }
    }

    /// 在单条连接上读消息，直到完成、取消或连接中断
    async fn read_until_done(
        &self,
        conn: &mut dyn StreamConnection,
        prompt_id: &str,
        cancel: &mut watch::Receiver<bool>,
        on_event: &mut (impl FnMut(ProgressEvent) + Send),
    ) -> Result<ReadResult, StreamError> {
        loop {
            let message = tokio::select! {
                result = tokio::time::timeout(self.idle_timeout, conn.next_message()) => {
                    match result {
                        Ok(inner) => inner,
                        Err(_) => {
                            return Ok(ReadResult::Disconnected(format!(
                                "空闲超时 ({}秒无消息)",
                                self.idle_timeout.as_secs()
                            )));
                        }
                    }
                }
                _ = cancel.changed() => return Ok(ReadResult::Cancelled),
            };

            match message {
                Ok(Some(StreamMessage::Text(text))) => {
                    match classify_message(&text, prompt_id)? {
                        Some(ProgressEvent::Completed) => {
                            on_event(ProgressEvent::Completed);
                            return Ok(ReadResult::Completed);
                        }
                        Some(event) => on_event(event),
                        None => {}
                    }
                }
                Ok(Some(StreamMessage::Binary(data))) => {
                    if data.len() > PREVIEW_HEADER_LEN {
                        on_event(ProgressEvent::Preview(data[PREVIEW_HEADER_LEN..].to_vec()));
                    }
                }
                Ok(None) => {
                    return Ok(ReadResult::Disconnected("通道被对端关闭".to_string()));
                }
                Err(e) => return Ok(ReadResult::Disconnected(e.to_string())),
            }
        }
    }
}

enum ReadResult {
    Completed,
    Cancelled,
    Disconnected(String),
}

/// 把单条文本消息翻译成进度事件
///
/// 带任务 ID 的消息类型只处理本任务的，其他任务的消息丢弃；
/// 无法识别的消息类型返回 None。后端报告执行失败时返回错误。
fn classify_message(text: &str, prompt_id: &str) -> Result<Option<ProgressEvent>, StreamError> {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        debug!("忽略无法解析的消息: {}", text);
        return Ok(None);
    };

    let msg_type = message.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let data = message.get("data").unwrap_or(&Value::Null);

    // 带任务 ID 的消息按任务过滤
    if let Some(id) = data.get("prompt_id").and_then(|v| v.as_str()) {
        if id != prompt_id {
            return Ok(None);
        }
    }

    let event = match msg_type {
        "status" => {
            let remaining = data
                .pointer("/status/exec_info/queue_remaining")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            Some(ProgressEvent::Queued { remaining })
        }
        "progress" => {
            let value = data.get("value").and_then(|v| v.as_u64()).unwrap_or(0);
            let max = data.get("max").and_then(|v| v.as_u64()).unwrap_or(0);
            Some(ProgressEvent::Progress { value, max })
        }
        "executing" => match data.get("node") {
            Some(Value::Null) => Some(ProgressEvent::Completed),
            Some(Value::String(node_id)) => Some(ProgressEvent::NodeStarted {
                node_id: node_id.clone(),
            }),
            _ => None,
        },
        "executed" => data
            .get("node")
            .and_then(|v| v.as_str())
            .map(|node_id| ProgressEvent::NodeFinished {
                node_id: node_id.to_string(),
            }),
        "execution_error" => {
            let node_id = data
                .get("node_id")
                .and_then(|v| v.as_str())
                .unwrap_or("?")
                .to_string();
            let reason = data
                .get("exception_message")
                .and_then(|v| v.as_str())
                .unwrap_or("未知错误")
                .to_string();
            return Err(StreamError::ExecutionFailed { node_id, reason });
        }
        _ => None,
    };

    Ok(event)
}
