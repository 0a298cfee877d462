//! 通信协议定义
//!
//! 两层协议共用一条 Unix Socket：
//! - 管理请求/响应：JSONL（每条消息一行 JSON + '\n'）
//! - 事件流：`Subscribe` 之后连接转为 SSE 帧格式
//!   （`event:` / `data:` / `id:` + 空行，与浏览器端 EventSource 兼容）

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 保留事件类型
pub mod event_type {
    pub const CONNECTED: &str = "connected";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SHUTDOWN: &str = "shutdown";
    pub const REQUEST_UPDATED: &str = "request_updated";
    pub const REQUEST_DELETED: &str = "request_deleted";
    pub const RESPONSE_UPDATED: &str = "response_updated";
    pub const RESPONSE_DELETED: &str = "response_deleted";
    pub const CLAUDE_REQUEST_QUEUED: &str = "claude_request_queued";
    pub const CLAUDE_PENDING_REQUESTS: &str = "claude_pending_requests";
    pub const FILE_WATCHER_ERROR: &str = "file_watcher_error";
}

/// 当前时间的 ISO-8601 字符串（毫秒精度，与 JS `toISOString` 一致）
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 事件信封（SSE 帧的 data 负载）
///
/// 字段顺序即序列化顺序，是与既有消费者的字节级兼容约定。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// 事件类型
    #[serde(rename = "type")]
    pub event_type: String,
    /// 负载
    pub data: Value,
    /// 格式化时间戳
    pub timestamp: String,
}

/// 格式化单条 SSE 消息
///
/// ```text
/// event: <eventType>
/// data: {"type":"<eventType>","data":<payload>,"timestamp":"<ISO-8601>"}
/// id: <monotonic integer>
///
/// ```
pub fn format_sse_message(event_type: &str, data: &Value, id: u64) -> String {
    let envelope = Envelope {
        event_type: event_type.to_string(),
        data: data.clone(),
        timestamp: now_iso(),
    };
    // Envelope 序列化不会失败（纯 JSON 值）
    let payload = serde_json::to_string(&envelope).unwrap_or_default();
    format!("event: {}\ndata: {}\nid: {}\n\n", event_type, payload, id)
}

/// 订阅端收到的事件（SSE 帧解析结果）
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// 事件类型
    pub event_type: String,
    /// 负载
    pub data: Value,
    /// 信封时间戳
    pub timestamp: String,
    /// 投递 ID（单连接内单调递增）
    pub id: Option<u64>,
}

/// 命令状态
///
/// 状态单调前进：pending → processed，永不回退。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Processing,
    Processed,
}

/// 命令请求体（跟踪文件 `request` 字段）
///
/// `extra` 透传未知字段，外部脚本可能写入额外数据。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: String,
    pub message: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// 跟踪文件记录
///
/// 跟踪文件是一个 JSON 数组，每次变更全量重写。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedCommand {
    pub request: CommandRequest,
    pub status: CommandStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<String>,
}

/// 命令文本文件内容（`command_<id>.txt`）
///
/// 外部自动化脚本按此格式读取，字段与顺序为字节级兼容约定。
/// `command` 与 `message` 为兼容性同时写入。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFile {
    pub id: String,
    pub command: String,
    pub message: String,
    pub timestamp: String,
}

/// 连接信息（管理接口返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub connected: bool,
    pub connected_at: String,
}

/// 管理请求（Client → Bridge）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeRequest {
    /// 订阅事件流（此后连接转为 SSE 帧模式）
    Subscribe {
        /// 客户端 ID，不提供则由服务端生成
        #[serde(default)]
        client_id: Option<String>,
    },

    /// 提交命令（写命令文件 + 追加跟踪记录）
    Execute { message: String },

    /// 标记命令已处理
    MarkProcessed { id: String },

    /// 按命令 ID 查询响应文件
    GetResponse { id: String },

    /// 广播事件给所有连接
    Broadcast {
        event_type: String,
        #[serde(default)]
        data: Value,
    },

    /// 发送事件给指定连接
    SendTo {
        client_id: String,
        event_type: String,
        #[serde(default)]
        data: Value,
    },

    /// 列出连接
    ListConnections,

    /// 查询状态
    Status,
}

/// 管理响应（Bridge → Client）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeResponse {
    /// 成功
    Ok,

    /// 错误
    Error { code: i32, message: String },

    /// 命令已入队
    Queued {
        command_id: String,
        file_name: String,
        queue_length: usize,
    },

    /// 命令响应内容
    CommandResponse { data: Value },

    /// 广播结果（立即投递数）
    Broadcasted { event_type: String, delivered: usize },

    /// 定向发送结果（false 表示已排队）
    Sent { client_id: String, delivered: bool },

    /// 连接列表
    Connections {
        count: usize,
        clients: Vec<ClientInfo>,
    },

    /// 状态信息
    StatusInfo {
        version: String,
        connections: usize,
        pending_commands: usize,
    },
}
