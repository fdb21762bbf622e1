/*!
 * 实时通道模块
 *
 * 整个应用共享一条持久连接，多个会话的订阅复用在这条连接上。
 *
 * 模块结构：
 * - protocol: Hub 协议消息定义与编解码（JSON + 记录分隔符）
 * - hub: 基于 tokio-tungstenite 的 Hub 连接（握手、调用、心跳、自动重连）
 * - rooms: 会话房间引用计数与重连后重新加入
 *
 * 同步器只依赖 `RealtimeChannel` trait，测试中可替换为内存实现。
 */

pub mod hub;
pub mod protocol;
pub mod rooms;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::error::Result;

pub use hub::{HubConnection, HubConnectionBuilder};
pub use rooms::RoomRegistry;

/// 连接状态
///
/// `Reconnected` 只作为事件广播，之后 `state()` 报告 `Connected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Reconnected,
    /// 重连次数用尽或服务器拒绝重连
    Closed,
}

/// 事件处理器标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// 事件处理器，参数为 Hub 推送的参数列表
pub type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// 实时通道能力
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// 注册事件处理器
    fn on(&self, event: &str, handler: EventHandler) -> HandlerId;

    /// 注销事件处理器
    fn off(&self, event: &str, id: HandlerId);

    /// 调用服务器方法并等待结果
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value>;

    /// 订阅连接状态变化
    fn connection_events(&self) -> broadcast::Receiver<ConnectionState>;

    fn state(&self) -> ConnectionState;
}

/// 事件处理器表（事件名不区分大小写）
#[derive(Default)]
pub struct HandlerTable {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, event: &str, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(event.to_lowercase())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn remove(&self, event: &str, id: HandlerId) {
        let mut handlers = self.handlers.write();
        let key = event.to_lowercase();
        if let Some(list) = handlers.get_mut(&key) {
            list.retain(|(handler_id, _)| *handler_id != id);
            if list.is_empty() {
                handlers.remove(&key);
            }
        }
    }

    /// 分发事件，返回调用的处理器数量
    ///
    /// 先复制处理器列表再调用，处理器内部可以安全地注册/注销
    pub fn dispatch(&self, event: &str, args: &[Value]) -> usize {
        let targets: Vec<EventHandler> = self
            .handlers
            .read()
            .get(&event.to_lowercase())
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in &targets {
            handler(args);
        }
        targets.len()
    }

    pub fn count(&self, event: &str) -> usize {
        self.handlers
            .read()
            .get(&event.to_lowercase())
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handler_table_dispatch() {
        let table = HandlerTable::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let id = table.add(
            "ReceiveMessage",
            Arc::new(move |args: &[Value]| {
                counter.fetch_add(args.len(), Ordering::SeqCst);
            }),
        );

        assert_eq!(table.dispatch("receivemessage", &[json!(1), json!(2)]), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        table.remove("RECEIVEMESSAGE", id);
        assert_eq!(table.count("ReceiveMessage"), 0);
        assert_eq!(table.dispatch("ReceiveMessage", &[]), 0);
    }
}
