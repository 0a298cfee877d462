//! bridge-agent - 实时通知桥服务进程
//!
//! 负责：
//! - 维护订阅连接并推送事件流
//! - 监听数据目录变化
//! - 轮询命令跟踪文件

use std::sync::Arc;

use anyhow::Result;
use auto_dev_bridge::{BridgeConfig, BridgeServer};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("auto_dev_bridge=debug".parse()?))
        .init();

    tracing::info!("🚀 bridge-agent v{}", env!("CARGO_PKG_VERSION"));

    // 解析配置
    let config = BridgeConfig::from_env();

    // 创建并运行 Bridge
    let server = Arc::new(BridgeServer::new(config)?);
    server.run().await?;

    tracing::info!("👋 bridge-agent exiting");
    Ok(())
}
