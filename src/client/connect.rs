//! Bridge Client 连接逻辑
//!
//! 订阅事件流，按事件类型分发给注册的处理器；流断开后以有界指数
//! 退避自动重连，直到达到次数上限或调用方显式断开。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::BridgeConfig;
use crate::protocol::{now_iso, BridgeRequest, Envelope, StreamEvent};

/// 重连延迟上限（毫秒）
const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Client 配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Socket 路径
    pub socket_path: PathBuf,
    /// 客户端 ID（不提供则由服务端生成）
    pub client_id: Option<String>,
    /// 重连基础间隔（毫秒）
    pub reconnect_interval_ms: u64,
    /// 最大重连次数
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: BridgeConfig::from_env().socket_path(),
            client_id: None,
            reconnect_interval_ms: 3000,
            max_reconnect_attempts: 10,
        }
    }
}

impl ClientConfig {
    /// 指定 socket 路径
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = path;
        self
    }

    /// 指定客户端 ID（重连时沿用同一 ID 以补发离线事件）
    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// 事件处理器
///
/// 返回 Err 只记录日志，不中断读取循环。
pub type EventHandler = Arc<dyn Fn(&StreamEvent) -> anyhow::Result<()> + Send + Sync>;

/// 重连延迟：`min(base * 2^attempts, 30000)` 毫秒
pub fn reconnect_delay(base_ms: u64, attempts: u32) -> u64 {
    base_ms
        .saturating_mul(2u64.saturating_pow(attempts))
        .min(MAX_RECONNECT_DELAY_MS)
}

/// SSE 帧（解析结果）
#[derive(Debug, Clone)]
struct SseFrame {
    event: Option<String>,
    data: String,
    id: Option<u64>,
}

/// SSE 帧解析器
///
/// 逐行喂入，空行结束一帧；`:` 开头的注释行忽略。
#[derive(Debug, Default)]
struct SseFrameParser {
    event: Option<String>,
    data: Option<String>,
    id: Option<u64>,
}

impl SseFrameParser {
    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            let data = self.data.take()?;
            return Some(SseFrame {
                event: self.event.take(),
                data,
                id: self.id.take(),
            });
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            "id" => self.id = value.parse().ok(),
            _ => {}
        }
        None
    }
}

/// Bridge Client
///
/// 状态机：Disconnected → Connecting → Connected → Reconnecting →
/// Connecting …；重连次数耗尽或调用方断开后回到终态 Disconnected，
/// 再次调用 [`BridgeClient::connect`] 可手动恢复。
pub struct BridgeClient {
    config: ClientConfig,
    /// 处理器表：事件类型 → 处理器列表（`*` 为通配）
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    status: RwLock<ConnectionStatus>,
    attempts: AtomicU32,
    should_reconnect: AtomicBool,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeClient {
    /// 创建 Client
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            handlers: RwLock::new(HashMap::new()),
            status: RwLock::new(ConnectionStatus::Disconnected),
            attempts: AtomicU32::new(0),
            should_reconnect: AtomicBool::new(true),
            shutdown: Notify::new(),
            task: Mutex::new(None),
        })
    }

    /// 注册事件处理器（`"*"` 匹配所有未注册类型）
    pub fn on<F>(&self, event_type: &str, handler: F)
    where
        F: Fn(&StreamEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// 当前连接状态
    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    /// 是否已连接
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// 建立连接并启动读取循环
    ///
    /// 重连耗尽后再次调用即为手动重连（重置计数）。
    pub fn connect(self: &Arc<Self>) {
        self.attempts.store(0, Ordering::Relaxed);
        self.should_reconnect.store(true, Ordering::Relaxed);

        let client = self.clone();
        let handle = tokio::spawn(async move {
            client.run_loop().await;
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// 断开连接（终止重连循环，转入终态 Disconnected）
    pub fn disconnect(&self) {
        self.should_reconnect.store(false, Ordering::Relaxed);
        self.shutdown.notify_waiters();
        *self.status.write() = ConnectionStatus::Disconnected;
        tracing::info!("🔌 Disconnected by caller");
    }

    /// 连接/重连主循环
    async fn run_loop(self: Arc<Self>) {
        loop {
            self.set_status(ConnectionStatus::Connecting);

            match UnixStream::connect(&self.config.socket_path).await {
                Ok(stream) => {
                    if let Err(e) = self.run_stream(stream).await {
                        tracing::debug!("事件流中断: {}", e);
                    }
                }
                Err(e) => {
                    tracing::debug!("连接失败: {}", e);
                }
            }

            if !self.should_reconnect.load(Ordering::Relaxed) {
                break;
            }

            let attempts = self.attempts.load(Ordering::Relaxed);
            if attempts >= self.config.max_reconnect_attempts {
                tracing::warn!(
                    "⚠️ Reconnect attempts exhausted ({}), giving up",
                    self.config.max_reconnect_attempts
                );
                break;
            }

            self.set_status(ConnectionStatus::Reconnecting);
            let delay = reconnect_delay(self.config.reconnect_interval_ms, attempts);
            self.attempts.store(attempts + 1, Ordering::Relaxed);
            tracing::info!("Reconnecting in {}ms (attempt {})", delay, attempts + 1);

            tokio::select! {
                _ = sleep(Duration::from_millis(delay)) => {}
                _ = self.shutdown.notified() => break,
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
    }

    /// 订阅并读取事件流，返回 Err 表示流断开
    async fn run_stream(&self, stream: UnixStream) -> anyhow::Result<()> {
        let (reader, mut writer) = stream.into_split();

        let subscribe = BridgeRequest::Subscribe {
            client_id: self.config.client_id.clone(),
        };
        writer
            .write_all(format!("{}\n", serde_json::to_string(&subscribe)?).as_bytes())
            .await?;

        let mut reader = BufReader::new(reader);
        let mut parser = SseFrameParser::default();
        let mut line = String::new();

        loop {
            line.clear();
            tokio::select! {
                read = reader.read_line(&mut line) => match read {
                    Ok(0) => anyhow::bail!("connection closed by peer"),
                    Ok(_) => {
                        let trimmed = line.trim_end_matches(['\r', '\n']);
                        if let Some(frame) = parser.feed_line(trimmed) {
                            self.mark_connected();
                            self.dispatch(frame);
                        }
                    }
                    Err(e) => return Err(e.into()),
                },
                _ = self.shutdown.notified() => return Ok(()),
            }
        }
    }

    /// 首帧到达即视为连接成功，重置重连计数
    fn mark_connected(&self) {
        let mut status = self.status.write();
        if *status != ConnectionStatus::Connected {
            *status = ConnectionStatus::Connected;
            self.attempts.store(0, Ordering::Relaxed);
            tracing::info!("🔌 Connected to bridge");
        }
    }

    /// 解析帧负载并分发
    ///
    /// 负载损坏不关闭流：记录日志并以 `error` 事件通知本地处理器。
    fn dispatch(&self, frame: SseFrame) {
        match serde_json::from_str::<Envelope>(&frame.data) {
            Ok(envelope) => {
                let event = StreamEvent {
                    event_type: envelope.event_type,
                    data: envelope.data,
                    timestamp: envelope.timestamp,
                    id: frame.id,
                };
                self.dispatch_event(&event);
            }
            Err(e) => {
                tracing::error!("解析事件负载失败: {}", e);
                let event = StreamEvent {
                    event_type: "error".to_string(),
                    data: json!({
                        "message": format!("Invalid payload: {}", e),
                        "raw": frame.data,
                    }),
                    timestamp: now_iso(),
                    id: frame.id,
                };
                self.dispatch_event(&event);
            }
        }
    }

    /// 按类型分发；未注册类型落到 `*` 通配处理器
    fn dispatch_event(&self, event: &StreamEvent) {
        let handlers: Vec<EventHandler> = {
            let registry = self.handlers.read();
            registry
                .get(&event.event_type)
                .or_else(|| registry.get("*"))
                .map(|list| list.to_vec())
                .unwrap_or_default()
        };

        for handler in handlers {
            if let Err(e) = handler(event) {
                tracing::error!("处理器执行失败: event_type={}, error={}", event.event_type, e);
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_reconnect_delay_sequence() {
        assert_eq!(reconnect_delay(3000, 0), 3000);
        assert_eq!(reconnect_delay(3000, 1), 6000);
        assert_eq!(reconnect_delay(3000, 2), 12000);
        assert_eq!(reconnect_delay(3000, 3), 24000);
        // 封顶 30s
        assert_eq!(reconnect_delay(3000, 4), 30000);
        assert_eq!(reconnect_delay(3000, 10), 30000);
        assert_eq!(reconnect_delay(3000, 63), 30000);
    }

    #[test]
    fn test_sse_parser_single_frame() {
        let mut parser = SseFrameParser::default();

        assert!(parser.feed_line("event: request_updated").is_none());
        assert!(parser
            .feed_line(r#"data: {"type":"request_updated","data":{},"timestamp":"t"}"#)
            .is_none());
        assert!(parser.feed_line("id: 42").is_none());

        let frame = parser.feed_line("").unwrap();
        assert_eq!(frame.event.as_deref(), Some("request_updated"));
        assert_eq!(frame.id, Some(42));
        assert!(frame.data.contains("request_updated"));
    }

    #[test]
    fn test_sse_parser_consecutive_frames_and_comments() {
        let mut parser = SseFrameParser::default();

        assert!(parser.feed_line(": keep-alive").is_none());
        parser.feed_line("event: a");
        parser.feed_line("data: {}");
        let first = parser.feed_line("").unwrap();
        assert_eq!(first.event.as_deref(), Some("a"));

        // 前一帧字段不泄漏到下一帧
        parser.feed_line("data: {}");
        let second = parser.feed_line("").unwrap();
        assert_eq!(second.event, None);
        assert_eq!(second.id, None);

        // 无 data 的空行不产出帧
        assert!(parser.feed_line("").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_by_type_with_wildcard_fallback() {
        let client = BridgeClient::new(ClientConfig::default());
        let typed = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));

        let counter = typed.clone();
        client.on("request_updated", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        let counter = wildcard.clone();
        client.on("*", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        let event = StreamEvent {
            event_type: "request_updated".to_string(),
            data: json!({}),
            timestamp: now_iso(),
            id: None,
        };
        client.dispatch_event(&event);
        // 已注册类型不再落入通配
        assert_eq!(typed.load(Ordering::Relaxed), 1);
        assert_eq!(wildcard.load(Ordering::Relaxed), 0);

        let event = StreamEvent {
            event_type: "heartbeat".to_string(),
            data: json!({}),
            timestamp: now_iso(),
            id: None,
        };
        client.dispatch_event(&event);
        assert_eq!(wildcard.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_dispatch() {
        let client = BridgeClient::new(ClientConfig::default());
        let called = Arc::new(AtomicUsize::new(0));

        client.on("request_updated", |_| anyhow::bail!("boom"));
        let counter = called.clone();
        client.on("request_updated", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        let event = StreamEvent {
            event_type: "request_updated".to_string(),
            data: json!({}),
            timestamp: now_iso(),
            id: None,
        };
        client.dispatch_event(&event);

        assert_eq!(called.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_surfaces_error_event() {
        let client = BridgeClient::new(ClientConfig::default());
        let errors = Arc::new(AtomicUsize::new(0));

        let counter = errors.clone();
        client.on("error", move |event| {
            assert!(event.data["message"]
                .as_str()
                .unwrap()
                .starts_with("Invalid payload"));
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        client.dispatch(SseFrame {
            event: Some("request_updated".to_string()),
            data: "not json".to_string(),
            id: Some(1),
        });

        assert_eq!(errors.load(Ordering::Relaxed), 1);
    }
}
