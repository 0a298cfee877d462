//! 事件广播器
//!
//! 维护连接注册表，将事件格式化为 SSE 帧并推送给订阅者。
//! 离线连接的事件进入每连接有界队列，重新注册时按原序补发。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::protocol::{event_type, format_sse_message, now_iso, ClientInfo};

/// 连接 ID（调用方提供或服务端生成）
pub type ClientId = String;

/// 消息发送通道（每连接一个写任务在对端排空）
pub type MessageSender = mpsc::Sender<String>;

/// 每连接离线队列容量，超出时淘汰最旧消息
const QUEUE_CAPACITY: usize = 50;

/// 连接状态
struct ClientConn {
    sender: MessageSender,
    connected: bool,
    connected_at: String,
}

/// 排队待投递的消息
struct QueuedMessage {
    event_type: String,
    data: Value,
    #[allow(dead_code)] // 入队时间，诊断用
    timestamp: String,
}

/// 事件广播器
///
/// 注册表保留已断开连接的条目（标记为 inactive），使 `broadcast`
/// 能继续为其排队；同 ID 重新注册时补发并清空队列。
pub struct Broadcaster {
    /// 连接注册表：ClientId → 连接状态（含 inactive 条目）
    clients: RwLock<HashMap<ClientId, ClientConn>>,
    /// 离线队列：ClientId → 有界 FIFO
    queues: RwLock<HashMap<ClientId, VecDeque<QueuedMessage>>>,
    /// 投递 ID（单调递增）
    next_event_id: AtomicU64,
    /// 心跳间隔
    heartbeat_interval: Duration,
    /// 心跳任务句柄
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    /// 创建新的广播器
    pub fn new(heartbeat_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            next_event_id: AtomicU64::new(1),
            heartbeat_interval,
            heartbeat: Mutex::new(None),
        })
    }

    /// 注册连接
    ///
    /// 发送初始 `connected` 事件（携带 clientId 与时间戳），随后按原序
    /// 补发该 ID 的离线队列并清空。初始写入失败只记录日志。
    pub fn register(&self, client_id: &str, sender: MessageSender) {
        self.clients.write().insert(
            client_id.to_string(),
            ClientConn {
                sender,
                connected: true,
                connected_at: now_iso(),
            },
        );
        tracing::debug!("📡 Client registered: client_id={}", client_id);

        let delivered = self.send(
            client_id,
            event_type::CONNECTED,
            json!({
                "message": "Connected to AUTO-DEV Bridge",
                "timestamp": now_iso(),
                "clientId": client_id,
            }),
        );
        if !delivered {
            tracing::warn!("初始 connected 事件发送失败: client_id={}", client_id);
        }

        self.flush_queued(client_id);
    }

    /// 注销连接（幂等）
    ///
    /// 标记为 inactive 但保留注册表条目，此后发往该 ID 的事件进入队列。
    pub fn deregister(&self, client_id: &str) {
        let mut clients = self.clients.write();
        if let Some(conn) = clients.get_mut(client_id) {
            if conn.connected {
                conn.connected = false;
                tracing::debug!("📡 Client disconnected: client_id={}", client_id);
            }
        }
    }

    /// 发送事件到指定连接
    ///
    /// 活跃连接：格式化 SSE 帧并写入，返回 true。
    /// 离线或未知连接：事件入队（必要时建队），返回 false。
    /// 传输故障：注销该连接，本条消息丢弃，返回 false。
    pub fn send(&self, client_id: &str, event: &str, data: Value) -> bool {
        let sender = {
            let clients = self.clients.read();
            match clients.get(client_id) {
                Some(conn) if conn.connected => Some(conn.sender.clone()),
                _ => None,
            }
        };

        let Some(sender) = sender else {
            self.queue_message(client_id, event, data);
            return false;
        };

        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let frame = format_sse_message(event, &data, id);

        match sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("📡 Channel full, dropping message: client_id={}", client_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("📡 Channel closed: client_id={}", client_id);
                self.deregister(client_id);
                false
            }
        }
    }

    /// 广播事件给注册表中的所有连接（inactive 条目进队列）
    ///
    /// 返回立即投递（未排队）的连接数。
    pub fn broadcast(&self, event: &str, data: Value, exclude: Option<&str>) -> usize {
        let targets: Vec<ClientId> = self.clients.read().keys().cloned().collect();

        let mut delivered = 0;
        for client_id in targets {
            if exclude == Some(client_id.as_str()) {
                continue;
            }
            if self.send(&client_id, event, data.clone()) {
                delivered += 1;
            }
        }

        tracing::debug!("📡 Broadcasted {} to {} clients", event, delivered);
        delivered
    }

    /// 广播事件给当前活跃连接，inactive 条目不排队
    ///
    /// 心跳这类纯活性信号走此路径：离线队列只保留业务事件，
    /// 活性信号过期即作废，补发没有意义。
    pub fn broadcast_connected(&self, event: &str, data: Value) -> usize {
        let targets: Vec<ClientId> = self
            .clients
            .read()
            .iter()
            .filter(|(_, conn)| conn.connected)
            .map(|(id, _)| id.clone())
            .collect();

        let mut delivered = 0;
        for client_id in targets {
            if self.send(&client_id, event, data.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// 启动心跳任务（固定间隔向活跃连接广播 `heartbeat`，携带当前连接数）
    pub fn start_heartbeat(self: &Arc<Self>) {
        let broadcaster = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(broadcaster.heartbeat_interval);
            ticker.tick().await; // 首个 tick 立即完成，跳过
            loop {
                ticker.tick().await;
                broadcaster.broadcast_connected(
                    event_type::HEARTBEAT,
                    json!({
                        "message": "ping",
                        "timestamp": now_iso(),
                        "connectedClients": broadcaster.connection_count(),
                    }),
                );
            }
        });
        *self.heartbeat.lock() = Some(handle);
    }

    /// 关闭广播器（终态操作，不可恢复）
    ///
    /// 停止心跳，广播 `shutdown`，丢弃所有发送端（关闭写任务），清空状态。
    pub fn shutdown(&self) {
        tracing::info!("📡 Shutting down broadcaster...");

        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }

        self.broadcast(
            event_type::SHUTDOWN,
            json!({
                "message": "Server is shutting down",
                "timestamp": now_iso(),
            }),
            None,
        );

        self.clients.write().clear();
        self.queues.write().clear();
    }

    /// 当前活跃连接数
    pub fn connection_count(&self) -> usize {
        self.clients.read().values().filter(|c| c.connected).count()
    }

    /// 是否存在活跃连接
    pub fn has_connections(&self) -> bool {
        self.connection_count() > 0
    }

    /// 指定 ID 是否在注册表中（含 inactive）
    pub fn knows_client(&self, client_id: &str) -> bool {
        self.clients.read().contains_key(client_id)
    }

    /// 所有注册表条目的连接信息
    pub fn client_infos(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .iter()
            .map(|(id, conn)| ClientInfo {
                id: id.clone(),
                connected: conn.connected,
                connected_at: conn.connected_at.clone(),
            })
            .collect()
    }

    /// 事件入队（有界，淘汰最旧）
    fn queue_message(&self, client_id: &str, event: &str, data: Value) {
        let mut queues = self.queues.write();
        let queue = queues.entry(client_id.to_string()).or_default();

        queue.push_back(QueuedMessage {
            event_type: event.to_string(),
            data,
            timestamp: now_iso(),
        });

        while queue.len() > QUEUE_CAPACITY {
            queue.pop_front();
        }
    }

    /// 补发离线队列并清空
    fn flush_queued(&self, client_id: &str) {
        let queued = self.queues.write().remove(client_id);
        let Some(queued) = queued else { return };
        if queued.is_empty() {
            return;
        }

        tracing::debug!(
            "📡 Flushing {} queued messages to {}",
            queued.len(),
            client_id
        );
        for message in queued {
            self.send(client_id, &message.event_type, message.data);
        }
    }
}
