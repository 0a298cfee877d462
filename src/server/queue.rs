//! 命令队列桥
//!
//! 维护命令跟踪文件（pending/processed 生命周期）并轮询新增的待处理
//! 记录。跟踪文件与命令文件和外部自动化脚本共享，磁盘内容是唯一
//! 事实来源，进程重启后不依赖任何内存状态。
//!
//! 已知限制（保留，不修复）：跟踪文件的读-改-全量重写在并发写入方
//! 之间存在竞态，部署约束为同一时刻至多一个写入方。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::broadcaster::Broadcaster;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::protocol::{
    event_type, now_iso, CommandFile, CommandRequest, CommandStatus, TrackedCommand,
};

/// 命令队列桥
pub struct CommandQueue {
    /// 跟踪文件路径
    tracking_path: PathBuf,
    /// 命令文件目录
    commands_dir: PathBuf,
    /// 命令响应目录
    responses_dir: PathBuf,
    /// 轮询间隔
    poll_interval: Duration,
    /// 上次读取的原始内容（字节级比较）
    last_content: Mutex<Option<String>>,
    /// 已上报过的记录 ID
    known_ids: Mutex<HashSet<String>>,
}

impl CommandQueue {
    /// 创建命令队列桥
    pub fn new(config: &BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            tracking_path: config.tracking_path(),
            commands_dir: config.commands_dir(),
            responses_dir: config.command_responses_dir(),
            poll_interval: config.poll_interval,
            last_content: Mutex::new(None),
            known_ids: Mutex::new(HashSet::new()),
        })
    }

    /// 入队新命令
    ///
    /// 写入命令文本文件（外部脚本的消费契约），再向跟踪文件追加
    /// pending 记录（读取-追加-全量重写）。返回当前队列长度。
    pub async fn enqueue(&self, id: &str, message: &str) -> Result<usize> {
        self.write_command_file(id, message).await?;

        let mut records = self.read_tracking().await?;
        records.push(TrackedCommand {
            request: CommandRequest {
                id: id.to_string(),
                message: message.to_string(),
                timestamp: now_iso(),
                extra: Default::default(),
            },
            status: CommandStatus::Pending,
            created_at: now_iso(),
            processed_at: None,
        });
        self.write_tracking(&records).await?;

        tracing::info!("📋 Command queued: id={}, queue_length={}", id, records.len());
        Ok(records.len())
    }

    /// 标记命令已处理（状态单调：pending → processed，不回退）
    ///
    /// 返回是否找到该记录。
    pub async fn mark_processed(&self, id: &str) -> Result<bool> {
        let mut records = self.read_tracking().await?;

        let Some(record) = records.iter_mut().find(|r| r.request.id == id) else {
            tracing::warn!("标记失败，记录不存在: id={}", id);
            return Ok(false);
        };

        record.status = CommandStatus::Processed;
        record.processed_at = Some(now_iso());
        self.write_tracking(&records).await?;

        tracing::info!("✅ Command processed: id={}", id);
        Ok(true)
    }

    /// 按命令 ID 查询响应文件（`<id>_response.json`）
    ///
    /// 文件不存在表示"尚未生成"，返回 None 而非错误。
    pub async fn response(&self, id: &str) -> Result<Option<Value>> {
        let path = self.responses_dir.join(format!("{}_response.json", id));

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 列出待处理的命令文件名（`command_*.txt`）
    pub async fn pending_command_files(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.commands_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("command_") && name.ends_with(".txt") {
                files.push(name);
            }
        }
        files.sort();
        Ok(files)
    }

    /// 启动时载入既有记录 ID，避免重复上报
    pub async fn load_known_ids(&self) {
        match tokio::fs::read_to_string(&self.tracking_path).await {
            Ok(content) => {
                match serde_json::from_str::<Vec<TrackedCommand>>(&content) {
                    Ok(records) => {
                        let mut known = self.known_ids.lock();
                        for record in &records {
                            known.insert(record.request.id.clone());
                        }
                        tracing::info!("📋 Loaded {} known commands", known.len());
                    }
                    Err(e) => {
                        tracing::error!("跟踪文件解析失败: {}", e);
                    }
                }
                *self.last_content.lock() = Some(content);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!("读取跟踪文件失败: {}", e);
            }
        }
    }

    /// 单次轮询
    ///
    /// 原始内容与上次逐字节相同则跳过；变化时重新解析，返回状态为
    /// pending 且 ID 未上报过的记录批次。文件消失不是错误：视为空
    /// 并清空已知 ID 集，文件重现时记录会被重新发现。
    pub async fn poll_once(&self) -> Vec<TrackedCommand> {
        let content = match tokio::fs::read_to_string(&self.tracking_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut last = self.last_content.lock();
                if last.is_some() {
                    *last = None;
                    self.known_ids.lock().clear();
                    tracing::debug!("跟踪文件消失，清空已知 ID 集");
                }
                return Vec::new();
            }
            Err(e) => {
                tracing::error!("读取跟踪文件失败: {}", e);
                return Vec::new();
            }
        };

        {
            let last = self.last_content.lock();
            if last.as_deref() == Some(content.as_str()) {
                return Vec::new();
            }
        }

        // 外部写入方可能正在重写，截断的内容留到下个周期重试
        let records: Vec<TrackedCommand> = match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("跟踪文件解析失败（可能被截断，下周期重试）: {}", e);
                return Vec::new();
            }
        };

        let mut fresh = Vec::new();
        {
            let mut known = self.known_ids.lock();
            for record in &records {
                if record.status == CommandStatus::Pending && !known.contains(&record.request.id) {
                    known.insert(record.request.id.clone());
                    fresh.push(record.clone());
                }
            }
        }
        *self.last_content.lock() = Some(content);

        if !fresh.is_empty() {
            tracing::info!("🔔 Found {} new pending commands", fresh.len());
        }
        fresh
    }

    /// 启动轮询循环，新批次通过广播器上报
    pub fn start(self: Arc<Self>, broadcaster: Arc<Broadcaster>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.load_known_ids().await;

            let mut ticker = interval(self.poll_interval);
            loop {
                ticker.tick().await;
                let fresh = self.poll_once().await;
                if fresh.is_empty() {
                    continue;
                }

                let payload = json!({
                    "count": fresh.len(),
                    "requests": fresh,
                });
                broadcaster.broadcast(event_type::CLAUDE_PENDING_REQUESTS, payload, None);
            }
        })
    }

    /// 写入命令文本文件（`command_<id>.txt`）
    ///
    /// 字段与排版是外部脚本的字节级契约。
    async fn write_command_file(&self, id: &str, message: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.commands_dir).await?;

        let file = CommandFile {
            id: id.to_string(),
            command: message.to_string(),
            message: message.to_string(),
            timestamp: now_iso(),
        };

        let path = self.commands_dir.join(command_file_name(id));
        tokio::fs::write(&path, serde_json::to_string_pretty(&file)?).await?;

        tracing::debug!("📝 Command file written: {:?}", path);
        Ok(path)
    }

    /// 读取跟踪文件（不存在视为空数组）
    async fn read_tracking(&self) -> Result<Vec<TrackedCommand>> {
        match tokio::fs::read_to_string(&self.tracking_path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// 全量重写跟踪文件
    async fn write_tracking(&self, records: &[TrackedCommand]) -> Result<()> {
        if let Some(parent) = self.tracking_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(records)?;
        tokio::fs::write(&self.tracking_path, content).await?;
        Ok(())
    }
}

/// 命令文件名（外部脚本按此模式匹配）
pub fn command_file_name(id: &str) -> String {
    format!("command_{}.txt", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_queue(dir: &std::path::Path) -> Arc<CommandQueue> {
        CommandQueue::new(&BridgeConfig::with_data_dir(dir))
    }

    #[tokio::test]
    async fn test_enqueue_then_mark_processed() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());

        queue.enqueue("cmd_1", "do X").await.unwrap();
        let found = queue.mark_processed("cmd_1").await.unwrap();
        assert!(found);

        let content =
            std::fs::read_to_string(dir.path().join("claude_requests.json")).unwrap();
        let records: Vec<TrackedCommand> = serde_json::from_str(&content).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CommandStatus::Processed);
        assert!(records[0].processed_at.is_some());
        assert_eq!(records[0].request.message, "do X");
    }

    #[tokio::test]
    async fn test_enqueue_writes_command_file() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());

        queue.enqueue("cmd_42", "hello").await.unwrap();

        let path = dir
            .path()
            .join("claude_commands")
            .join("command_cmd_42.txt");
        let content = std::fs::read_to_string(path).unwrap();
        let file: CommandFile = serde_json::from_str(&content).unwrap();
        assert_eq!(file.id, "cmd_42");
        assert_eq!(file.command, "hello");
        assert_eq!(file.message, "hello");
    }

    #[tokio::test]
    async fn test_mark_processed_unknown_id() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());

        let found = queue.mark_processed("nope").await.unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn test_poll_reports_only_new_pending() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());

        let records = json!([
            {
                "request": {"id": "r1", "message": "a", "timestamp": "t"},
                "status": "pending",
                "created_at": "t"
            },
            {
                "request": {"id": "r2", "message": "b", "timestamp": "t"},
                "status": "processed",
                "created_at": "t",
                "processed_at": "t"
            }
        ]);
        std::fs::write(
            dir.path().join("claude_requests.json"),
            serde_json::to_string_pretty(&records).unwrap(),
        )
        .unwrap();

        let fresh = queue.poll_once().await;
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].request.id, "r1");

        // 内容未变：不再上报
        let fresh = queue.poll_once().await;
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn test_poll_skips_known_ids_after_load() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());

        let records = json!([
            {
                "request": {"id": "r1", "message": "a", "timestamp": "t"},
                "status": "pending",
                "created_at": "t"
            }
        ]);
        let path = dir.path().join("claude_requests.json");
        std::fs::write(&path, serde_json::to_string_pretty(&records).unwrap()).unwrap();

        // 启动载入后，既有 pending 记录不重复上报
        queue.load_known_ids().await;
        let fresh = queue.poll_once().await;
        assert!(fresh.is_empty());

        // 新记录出现时只上报新 ID
        let records = json!([
            {
                "request": {"id": "r1", "message": "a", "timestamp": "t"},
                "status": "pending",
                "created_at": "t"
            },
            {
                "request": {"id": "r3", "message": "c", "timestamp": "t"},
                "status": "pending",
                "created_at": "t"
            }
        ]);
        std::fs::write(&path, serde_json::to_string_pretty(&records).unwrap()).unwrap();

        let fresh = queue.poll_once().await;
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].request.id, "r3");
    }

    #[tokio::test]
    async fn test_missing_file_clears_known_ids() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let path = dir.path().join("claude_requests.json");

        let records = json!([
            {
                "request": {"id": "r1", "message": "a", "timestamp": "t"},
                "status": "pending",
                "created_at": "t"
            }
        ]);
        std::fs::write(&path, serde_json::to_string_pretty(&records).unwrap()).unwrap();
        assert_eq!(queue.poll_once().await.len(), 1);

        // 文件消失：视为空，已知 ID 清空
        std::fs::remove_file(&path).unwrap();
        assert!(queue.poll_once().await.is_empty());

        // 文件重现：记录被重新发现
        std::fs::write(&path, serde_json::to_string_pretty(&records).unwrap()).unwrap();
        let fresh = queue.poll_once().await;
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].request.id, "r1");
    }

    #[tokio::test]
    async fn test_truncated_file_retried_next_cycle() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let path = dir.path().join("claude_requests.json");

        std::fs::write(&path, "[{\"request\": {\"id\": \"r1\"").unwrap();
        assert!(queue.poll_once().await.is_empty());

        let records = json!([
            {
                "request": {"id": "r1", "message": "a", "timestamp": "t"},
                "status": "pending",
                "created_at": "t"
            }
        ]);
        std::fs::write(&path, serde_json::to_string_pretty(&records).unwrap()).unwrap();
        assert_eq!(queue.poll_once().await.len(), 1);
    }

    #[tokio::test]
    async fn test_response_lookup() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());

        assert!(queue.response("cmd_1").await.unwrap().is_none());

        let responses_dir = dir.path().join("claude_responses");
        std::fs::create_dir_all(&responses_dir).unwrap();
        std::fs::write(
            responses_dir.join("cmd_1_response.json"),
            r#"{"cmd_1": {"status": "success"}}"#,
        )
        .unwrap();

        let response = queue.response("cmd_1").await.unwrap().unwrap();
        assert_eq!(response["cmd_1"]["status"], "success");
    }

    #[tokio::test]
    async fn test_pending_command_files() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());

        assert!(queue.pending_command_files().await.unwrap().is_empty());

        queue.enqueue("cmd_1", "a").await.unwrap();
        queue.enqueue("cmd_2", "b").await.unwrap();

        let files = queue.pending_command_files().await.unwrap();
        assert_eq!(files, vec!["command_cmd_1.txt", "command_cmd_2.txt"]);
    }
}
