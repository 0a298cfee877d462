//! auto-dev-bridge - 实时通知桥
//!
//! 连接自动开发工作流与 UI 的事件桥：服务端监听共享数据目录变化并向
//! 订阅者推送 SSE 格式事件流，客户端以自动重连的方式消费事件。
//!
//! # 核心功能
//!
//! - **事件广播**: 订阅连接管理 + 离线队列补发 + 心跳
//! - **变更检测**: requests / responses 目录监听（防抖去重）
//! - **命令队列桥**: 共享跟踪文件轮询，上报新增待处理命令
//! - **重连客户端**: 有界指数退避 + 按类型分发的处理器表
//!
//! # Feature Flags
//!
//! - `server`: Bridge 服务端（广播器 + 文件监听 + 队列轮询）
//! - `client`: 重连客户端（供 UI / 工具进程使用）
//!
//! # 架构
//!
//! 服务端是数据目录的唯一事件源，所有消费方通过 Unix socket 订阅事件流。
//! 管理操作（提交命令、查询状态）走同一条连接的 JSONL 请求/响应。

pub mod config;
pub mod error;
pub mod protocol;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "client")]
pub mod client;

// Re-exports
pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use protocol::{
    event_type, format_sse_message, now_iso, BridgeRequest, BridgeResponse, ClientInfo,
    CommandFile, CommandRequest, CommandStatus, Envelope, StreamEvent, TrackedCommand,
};

#[cfg(feature = "server")]
pub use server::{
    Broadcaster, BridgeServer, ChangeWatcher, CommandQueue, FileEventKind, Handler,
    WatcherHandle, BRIDGE_VERSION,
};

#[cfg(feature = "client")]
pub use client::{reconnect_delay, BridgeClient, ClientConfig, ConnectionStatus, EventHandler};
