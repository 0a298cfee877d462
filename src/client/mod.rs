//! Bridge Client 模块
//!
//! 提供订阅事件流的重连客户端

mod connect;

pub use connect::{
    reconnect_delay, BridgeClient, ClientConfig, ConnectionStatus, EventHandler,
};
