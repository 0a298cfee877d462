//! Bridge 配置

use std::path::PathBuf;
use std::time::Duration;

/// Bridge 配置
///
/// 所有路径从 `data_dir` 派生。`DATA_PATH` 环境变量可覆盖数据目录，
/// 与外部自动化脚本共享同一套磁盘布局。
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// 数据目录（默认 ~/.auto-dev-bridge/data）
    pub data_dir: PathBuf,
    /// 心跳间隔
    pub heartbeat_interval: Duration,
    /// 命令队列轮询间隔
    pub poll_interval: Duration,
    /// 文件事件防抖窗口
    pub debounce_window: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl BridgeConfig {
    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        let data_dir = match std::env::var("DATA_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".auto-dev-bridge")
                .join("data"),
        };

        Self::with_data_dir(data_dir)
    }

    /// 指定数据目录创建配置（测试用）
    pub fn with_data_dir<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            debounce_window: Duration::from_millis(100),
        }
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("bridge.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("bridge.pid")
    }

    /// 请求目录（文件监听对象）
    pub fn requests_dir(&self) -> PathBuf {
        self.data_dir.join("requests")
    }

    /// 响应目录（文件监听对象）
    pub fn responses_dir(&self) -> PathBuf {
        self.data_dir.join("responses")
    }

    /// 命令文件目录（外部自动化消费者读取）
    pub fn commands_dir(&self) -> PathBuf {
        self.data_dir.join("claude_commands")
    }

    /// 命令响应目录（外部自动化消费者写入）
    pub fn command_responses_dir(&self) -> PathBuf {
        self.data_dir.join("claude_responses")
    }

    /// 命令跟踪文件（pending/processed 生命周期）
    pub fn tracking_path(&self) -> PathBuf {
        self.data_dir.join("claude_requests.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_derive_from_data_dir() {
        let config = BridgeConfig::with_data_dir("/tmp/bridge-test");

        assert_eq!(
            config.tracking_path(),
            PathBuf::from("/tmp/bridge-test/claude_requests.json")
        );
        assert_eq!(
            config.commands_dir(),
            PathBuf::from("/tmp/bridge-test/claude_commands")
        );
        assert_eq!(
            config.socket_path(),
            PathBuf::from("/tmp/bridge-test/bridge.sock")
        );
    }
}
