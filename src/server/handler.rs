//! 管理请求处理器

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use super::broadcaster::Broadcaster;
use super::queue::{command_file_name, CommandQueue};
use crate::protocol::{event_type, BridgeRequest, BridgeResponse};

/// Bridge 版本号（跟随 crate 版本）
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 管理请求处理器
pub struct Handler {
    /// 广播器
    broadcaster: Arc<Broadcaster>,
    /// 命令队列桥
    queue: Arc<CommandQueue>,
}

impl Handler {
    /// 创建处理器
    pub fn new(broadcaster: Arc<Broadcaster>, queue: Arc<CommandQueue>) -> Self {
        Self { broadcaster, queue }
    }

    /// 处理请求
    ///
    /// `Subscribe` 由连接循环处理，不会到达这里。
    pub async fn handle(&self, request: BridgeRequest) -> BridgeResponse {
        match request {
            BridgeRequest::Subscribe { .. } => BridgeResponse::Error {
                code: 400,
                message: "Already subscribed".to_string(),
            },

            BridgeRequest::Execute { message } => self.handle_execute(&message).await,

            BridgeRequest::MarkProcessed { id } => match self.queue.mark_processed(&id).await {
                Ok(true) => BridgeResponse::Ok,
                Ok(false) => BridgeResponse::Error {
                    code: 404,
                    message: format!("Command {} not found", id),
                },
                Err(e) => {
                    tracing::error!("Failed to mark command processed: {}", e);
                    BridgeResponse::Error {
                        code: 500,
                        message: format!("Failed to mark processed: {}", e),
                    }
                }
            },

            BridgeRequest::GetResponse { id } => match self.queue.response(&id).await {
                Ok(Some(data)) => BridgeResponse::CommandResponse { data },
                Ok(None) => BridgeResponse::Error {
                    code: 404,
                    message: "Response not yet available".to_string(),
                },
                Err(e) => {
                    tracing::error!("Failed to read response: {}", e);
                    BridgeResponse::Error {
                        code: 500,
                        message: format!("Failed to read response: {}", e),
                    }
                }
            },

            BridgeRequest::Broadcast { event_type, data } => {
                let delivered = self.broadcaster.broadcast(&event_type, data, None);
                BridgeResponse::Broadcasted {
                    event_type,
                    delivered,
                }
            }

            BridgeRequest::SendTo {
                client_id,
                event_type,
                data,
            } => {
                if !self.broadcaster.knows_client(&client_id) {
                    return BridgeResponse::Error {
                        code: 404,
                        message: format!("Client {} not found", client_id),
                    };
                }
                let delivered = self.broadcaster.send(&client_id, &event_type, data);
                BridgeResponse::Sent {
                    client_id,
                    delivered,
                }
            }

            BridgeRequest::ListConnections => BridgeResponse::Connections {
                count: self.broadcaster.connection_count(),
                clients: self.broadcaster.client_infos(),
            },

            BridgeRequest::Status => {
                let pending_commands = self
                    .queue
                    .pending_command_files()
                    .await
                    .map(|files| files.len())
                    .unwrap_or(0);
                BridgeResponse::StatusInfo {
                    version: BRIDGE_VERSION.to_string(),
                    connections: self.broadcaster.connection_count(),
                    pending_commands,
                }
            }
        }
    }

    /// 提交命令：生成 ID、写命令文件、追加跟踪记录、广播入队通知
    async fn handle_execute(&self, message: &str) -> BridgeResponse {
        if message.is_empty() {
            return BridgeResponse::Error {
                code: 400,
                message: "Message is required".to_string(),
            };
        }

        let command_id = format!("cmd_{}", Utc::now().timestamp_millis());

        match self.queue.enqueue(&command_id, message).await {
            Ok(queue_length) => {
                self.broadcaster.broadcast(
                    event_type::CLAUDE_REQUEST_QUEUED,
                    json!({
                        "request_id": command_id,
                        "message": "Request queued for Claude Code processing",
                        "queue_length": queue_length,
                    }),
                    None,
                );

                BridgeResponse::Queued {
                    file_name: command_file_name(&command_id),
                    command_id,
                    queue_length,
                }
            }
            Err(e) => {
                tracing::error!("Failed to queue command: {}", e);
                BridgeResponse::Error {
                    code: 500,
                    message: format!("Failed to queue command: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_handler(dir: &std::path::Path) -> Handler {
        let config = BridgeConfig::with_data_dir(dir);
        let broadcaster = Broadcaster::new(Duration::from_secs(30));
        let queue = CommandQueue::new(&config);
        Handler::new(broadcaster, queue)
    }

    #[tokio::test]
    async fn test_execute_queues_and_broadcasts() {
        let dir = tempdir().unwrap();
        let handler = test_handler(dir.path());

        let (tx, mut rx) = tokio::sync::mpsc::channel(10);
        handler.broadcaster.register("ui", tx);
        rx.try_recv().unwrap(); // connected

        let response = handler
            .handle(BridgeRequest::Execute {
                message: "do X".to_string(),
            })
            .await;

        match response {
            BridgeResponse::Queued {
                command_id,
                file_name,
                queue_length,
            } => {
                assert!(command_id.starts_with("cmd_"));
                assert_eq!(file_name, format!("command_{}.txt", command_id));
                assert_eq!(queue_length, 1);
            }
            other => panic!("Expected Queued, got {:?}", other),
        }

        let frame = rx.try_recv().unwrap();
        assert!(frame.starts_with("event: claude_request_queued\n"));
        assert!(frame.contains("\"queue_length\":1"));
    }

    #[tokio::test]
    async fn test_execute_rejects_empty_message() {
        let dir = tempdir().unwrap();
        let handler = test_handler(dir.path());

        let response = handler
            .handle(BridgeRequest::Execute {
                message: String::new(),
            })
            .await;
        assert!(matches!(response, BridgeResponse::Error { code: 400, .. }));
    }

    #[tokio::test]
    async fn test_send_to_unknown_client_is_not_found() {
        let dir = tempdir().unwrap();
        let handler = test_handler(dir.path());

        let response = handler
            .handle(BridgeRequest::SendTo {
                client_id: "ghost".to_string(),
                event_type: "request_updated".to_string(),
                data: json!({}),
            })
            .await;
        assert!(matches!(response, BridgeResponse::Error { code: 404, .. }));
    }

    #[tokio::test]
    async fn test_send_to_disconnected_client_reports_queued() {
        let dir = tempdir().unwrap();
        let handler = test_handler(dir.path());

        let (tx, _rx) = tokio::sync::mpsc::channel(10);
        handler.broadcaster.register("c1", tx);
        handler.broadcaster.deregister("c1");

        let response = handler
            .handle(BridgeRequest::SendTo {
                client_id: "c1".to_string(),
                event_type: "request_updated".to_string(),
                data: json!({}),
            })
            .await;

        match response {
            BridgeResponse::Sent { delivered, .. } => assert!(!delivered),
            other => panic!("Expected Sent, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_reports_pending_commands() {
        let dir = tempdir().unwrap();
        let handler = test_handler(dir.path());

        handler.queue.enqueue("cmd_1", "x").await.unwrap();

        let response = handler.handle(BridgeRequest::Status).await;
        match response {
            BridgeResponse::StatusInfo {
                pending_commands,
                connections,
                ..
            } => {
                assert_eq!(pending_commands, 1);
                assert_eq!(connections, 0);
            }
            other => panic!("Expected StatusInfo, got {:?}", other),
        }
    }
}
