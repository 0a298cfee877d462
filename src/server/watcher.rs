//! 文件变更检测器
//!
//! 监听 requests / responses 目录的文件系统事件，按路径防抖合并后
//! 归类为语义事件并交给广播器。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::broadcaster::Broadcaster;
use crate::error::Result;
use crate::protocol::{event_type, now_iso};

/// 原始文件事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    Add,
    Change,
    Unlink,
}

impl FileEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventKind::Add => "add",
            FileEventKind::Change => "change",
            FileEventKind::Unlink => "unlink",
        }
    }
}

/// notify 回调发往驱动任务的消息
enum RawMessage {
    Event(FileEventKind, PathBuf),
    Error(String),
}

/// 文件变更检测器
pub struct ChangeWatcher {
    /// 监听根目录
    roots: Vec<PathBuf>,
    /// 防抖窗口
    window: Duration,
    /// 相对路径基准（数据目录）
    data_dir: PathBuf,
}

/// 运行中的检测器句柄
pub struct WatcherHandle {
    driver: JoinHandle<()>,
}

impl WatcherHandle {
    /// 停止检测：终止驱动任务，丢弃 notify 句柄，取消所有待触发的防抖计时器
    pub fn stop(&self) {
        self.driver.abort();
    }
}

impl ChangeWatcher {
    /// 创建检测器
    pub fn new(roots: Vec<PathBuf>, window: Duration, data_dir: PathBuf) -> Self {
        Self {
            roots,
            window,
            data_dir,
        }
    }

    /// 启动监听
    ///
    /// 单个目录监听失败只告警并继续其余目录，不让进程退出。
    pub fn start(self, broadcaster: Arc<Broadcaster>) -> Result<WatcherHandle> {
        let (raw_tx, raw_rx) = mpsc::channel::<RawMessage>(256);

        let tx = raw_tx.clone();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let Some(kind) = map_event_kind(&event.kind) else {
                        return;
                    };
                    for path in event.paths {
                        let _ = tx.blocking_send(RawMessage::Event(kind, path));
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(RawMessage::Error(e.to_string()));
                }
            },
        )?;

        let mut watching = 0usize;
        for root in &self.roots {
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => {
                    tracing::info!("👁️ Watching directory: {:?}", root);
                    watching += 1;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Failed to watch directory {:?}: {}", root, e);
                }
            }
        }

        if watching == 0 {
            tracing::warn!("⚠️ No valid watch directories found");
        }

        let window = self.window;
        let data_dir = self.data_dir.clone();
        let driver = tokio::spawn(async move {
            // 保持 watcher 存活；驱动任务被终止时一并释放
            let _watcher = watcher;
            run_driver(raw_rx, window, data_dir, broadcaster).await;
        });

        tracing::info!("🔄 Change watcher started ({} directories)", watching);
        Ok(WatcherHandle { driver })
    }
}

/// notify 事件类型映射（其余类型忽略）
fn map_event_kind(kind: &EventKind) -> Option<FileEventKind> {
    match kind {
        EventKind::Create(_) => Some(FileEventKind::Add),
        EventKind::Modify(_) => Some(FileEventKind::Change),
        EventKind::Remove(_) => Some(FileEventKind::Unlink),
        _ => None,
    }
}

/// 驱动循环：原始事件 → 防抖 → 归类 → 广播
async fn run_driver(
    mut raw_rx: mpsc::Receiver<RawMessage>,
    window: Duration,
    data_dir: PathBuf,
    broadcaster: Arc<Broadcaster>,
) {
    let (deb_in_tx, deb_in_rx) = mpsc::channel(256);
    let (deb_out_tx, mut deb_out_rx) = mpsc::channel(256);
    let debounce_task = tokio::spawn(debounce_events(deb_in_rx, window, deb_out_tx));

    loop {
        tokio::select! {
            msg = raw_rx.recv() => match msg {
                Some(RawMessage::Event(kind, path)) => {
                    if deb_in_tx.send((kind, path)).await.is_err() {
                        break;
                    }
                }
                Some(RawMessage::Error(error)) => {
                    tracing::error!("File watcher error: {}", error);
                    broadcaster.broadcast(
                        event_type::FILE_WATCHER_ERROR,
                        json!({ "error": error }),
                        None,
                    );
                }
                None => break,
            },
            coalesced = deb_out_rx.recv() => {
                let Some((kind, path)) = coalesced else { break };
                emit_semantic(&broadcaster, &data_dir, kind, &path);
            }
        }
    }

    debounce_task.abort();
}

/// 防抖计时器
struct PendingTimer {
    kind: FileEventKind,
    generation: u64,
    handle: JoinHandle<()>,
}

/// 按路径防抖
///
/// 每条路径至多一个待触发计时器；新事件取消并重启计时器，同时记下
/// 最后一次观察到的事件类型。窗口到期只发出一条合并事件，携带最后类型。
pub(crate) async fn debounce_events(
    mut raw_rx: mpsc::Receiver<(FileEventKind, PathBuf)>,
    window: Duration,
    out_tx: mpsc::Sender<(FileEventKind, PathBuf)>,
) {
    let (fired_tx, mut fired_rx) = mpsc::channel::<(PathBuf, u64)>(256);
    let mut timers: HashMap<PathBuf, PendingTimer> = HashMap::new();
    let mut generation = 0u64;

    loop {
        tokio::select! {
            raw = raw_rx.recv() => {
                let Some((kind, path)) = raw else { break };

                generation += 1;
                let fired_tx = fired_tx.clone();
                let timer_path = path.clone();
                let timer_generation = generation;
                let handle = tokio::spawn(async move {
                    sleep(window).await;
                    let _ = fired_tx.send((timer_path, timer_generation)).await;
                });

                if let Some(previous) = timers.insert(
                    path,
                    PendingTimer { kind, generation, handle },
                ) {
                    previous.handle.abort();
                }
            }
            fired = fired_rx.recv() => {
                let Some((path, fired_generation)) = fired else { break };

                // 计时器触发后又来了新事件时，generation 不再匹配，忽略旧触发
                let current = timers
                    .get(&path)
                    .map(|t| t.generation == fired_generation)
                    .unwrap_or(false);
                if !current {
                    continue;
                }

                if let Some(timer) = timers.remove(&path) {
                    if out_tx.send((timer.kind, path)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    for (_, timer) in timers {
        timer.handle.abort();
    }
}

/// 归类并广播合并后的事件（无法归类的只记录日志）
fn emit_semantic(
    broadcaster: &Broadcaster,
    data_dir: &Path,
    kind: FileEventKind,
    path: &Path,
) {
    let relative = relative_path(data_dir, path);
    tracing::debug!("📝 File {}: {}", kind.as_str(), relative);

    let Some(semantic) = classify(kind, &relative) else {
        return;
    };

    broadcaster.broadcast(
        semantic,
        json!({
            "type": kind.as_str(),
            "path": path.to_string_lossy(),
            "relativePath": relative,
            "timestamp": now_iso(),
        }),
        None,
    );
}

/// 数据目录相对路径（超出数据目录的路径退回完整路径）
fn relative_path(data_dir: &Path, path: &Path) -> String {
    path.strip_prefix(data_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

/// 按路径段归类语义事件类型
///
/// requests 在 responses 之前检查，顺序是既有行为的一部分。
pub(crate) fn classify(kind: FileEventKind, relative_path: &str) -> Option<&'static str> {
    if relative_path.contains("requests") {
        Some(match kind {
            FileEventKind::Add | FileEventKind::Change => event_type::REQUEST_UPDATED,
            FileEventKind::Unlink => event_type::REQUEST_DELETED,
        })
    } else if relative_path.contains("responses") {
        Some(match kind {
            FileEventKind::Add | FileEventKind::Change => event_type::RESPONSE_UPDATED,
            FileEventKind::Unlink => event_type::RESPONSE_DELETED,
        })
    } else {
        None
    }
}
