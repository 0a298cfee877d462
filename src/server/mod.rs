//! Bridge 服务端 - 事件广播 + 文件监听 + 命令队列
//!
//! 服务端负责：
//! - 维护订阅连接，推送 SSE 格式事件流
//! - 监听 requests / responses 目录变化并广播语义事件
//! - 轮询命令跟踪文件，上报新增的待处理命令
//! - 处理管理请求（提交命令、定向发送、连接查询）

mod broadcaster;
mod handler;
mod queue;
mod watcher;

pub use broadcaster::{Broadcaster, ClientId, MessageSender};
pub use handler::{Handler, BRIDGE_VERSION};
pub use queue::{command_file_name, CommandQueue};
pub use watcher::{ChangeWatcher, FileEventKind, WatcherHandle};

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::protocol::{BridgeRequest, BridgeResponse};

/// Bridge 服务
pub struct BridgeServer {
    config: BridgeConfig,
    broadcaster: Arc<Broadcaster>,
    queue: Arc<CommandQueue>,
    handler: Arc<Handler>,
}

impl BridgeServer {
    /// 创建服务
    pub fn new(config: BridgeConfig) -> Result<Self> {
        for dir in [
            config.data_dir.clone(),
            config.requests_dir(),
            config.responses_dir(),
            config.commands_dir(),
            config.command_responses_dir(),
        ] {
            fs::create_dir_all(&dir).context("创建数据目录失败")?;
        }

        let broadcaster = Broadcaster::new(config.heartbeat_interval);
        let queue = CommandQueue::new(&config);
        let handler = Arc::new(Handler::new(broadcaster.clone(), queue.clone()));

        Ok(Self {
            config,
            broadcaster,
            queue,
            handler,
        })
    }

    /// 广播器（供嵌入方直接发事件）
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// 运行服务
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.write_pid_file()?;

        // 清理旧的 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path).context("绑定 socket 失败")?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;

        tracing::info!("🚀 Bridge started: {:?}", socket_path);

        // 文件变更检测
        let watcher = ChangeWatcher::new(
            vec![self.config.requests_dir(), self.config.responses_dir()],
            self.config.debounce_window,
            self.config.data_dir.clone(),
        );
        let watcher_handle = watcher.start(self.broadcaster.clone())?;

        // 命令队列轮询
        let poll_handle = self.queue.clone().start(self.broadcaster.clone());

        // 心跳
        self.broadcaster.start_heartbeat();

        // 接受连接
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    tracing::error!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("收到中断信号，准备退出...");
                    break;
                }
            }
        }

        watcher_handle.stop();
        poll_handle.abort();
        self.broadcaster.shutdown();
        self.cleanup();
        Ok(())
    }

    /// 处理单个连接
    ///
    /// 连接初始为管理模式（JSONL 请求/响应）；收到 `Subscribe` 后注册到
    /// 广播器，此后该连接持续接收 SSE 帧直到断开，后续管理请求只记日志
    /// 不再应答。
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let (tx, mut rx) = mpsc::channel::<String>(100);

        let write_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut subscribed: Option<ClientId> = None;
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if line.trim().is_empty() {
                        continue;
                    }

                    let request: BridgeRequest = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("解析请求失败: {}", e);
                            let response = BridgeResponse::Error {
                                code: 400,
                                message: format!("Invalid JSON: {}", e),
                            };
                            if !self.respond(&tx, &response).await {
                                break;
                            }
                            continue;
                        }
                    };

                    match request {
                        BridgeRequest::Subscribe { client_id } if subscribed.is_none() => {
                            let client_id =
                                client_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                            tracing::info!("📥 Subscriber connected: client_id={}", client_id);
                            // register 发送 connected 事件并补发离线队列
                            self.broadcaster.register(&client_id, tx.clone());
                            subscribed = Some(client_id);
                        }
                        // 订阅后连接已是纯事件流，JSONL 响应会污染 SSE 帧
                        request if subscribed.is_some() => {
                            tracing::warn!(
                                "订阅连接上收到管理请求，忽略: client_id={:?}, request={:?}",
                                subscribed,
                                request
                            );
                        }
                        request => {
                            let response = self.handler.handle(request).await;
                            if !self.respond(&tx, &response).await {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("读取失败: {}", e);
                    break;
                }
            }
        }

        if let Some(client_id) = subscribed {
            self.broadcaster.deregister(&client_id);
            tracing::info!("📤 Subscriber disconnected: client_id={}", client_id);
        }
        write_handle.abort();

        Ok(())
    }

    /// 写一行 JSONL 响应（false 表示连接已断）
    async fn respond(&self, tx: &MessageSender, response: &BridgeResponse) -> bool {
        let json = match serde_json::to_string(response) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("序列化响应失败: {}", e);
                return true;
            }
        };
        tx.send(format!("{}\n", json)).await.is_ok()
    }

    /// 写入 PID 文件
    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let pid_path = self.config.pid_path();
        fs::write(&pid_path, pid.to_string())?;
        fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600))?;
        tracing::debug!("📝 写入 PID 文件: {} (pid={})", pid_path.display(), pid);
        Ok(())
    }

    /// 清理 socket / PID 文件
    fn cleanup(&self) {
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        let pid_path = self.config.pid_path();
        if pid_path.exists() {
            let _ = fs::remove_file(&pid_path);
        }

        tracing::info!("🧹 Bridge cleanup complete");
    }
}
