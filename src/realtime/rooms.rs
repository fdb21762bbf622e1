/*!
 * 会话房间管理
 *
 * 多个同步器共享一条 Hub 连接。房间加入按会话引用计数：
 * - 计数从 0 变为 1 时调用加入方法
 * - 计数从 1 变为 0 时调用离开方法
 * - 连接重连成功后，所有计数大于 0 的房间重新加入
 *
 * 关闭某个会话视图只会减少计数，不会影响其他视图，也不会断开共享连接。
 */

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::{ConnectionState, RealtimeChannel};
use crate::config::HubNames;
use crate::error::Result;
use crate::model::ConversationKey;

/// 房间注册表
pub struct RoomRegistry {
    channel: Arc<dyn RealtimeChannel>,
    names: HubNames,
    rooms: Mutex<HashMap<ConversationKey, usize>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl RoomRegistry {
    /// 创建注册表并启动重连监听（需在 tokio 运行时内调用）
    pub fn new(channel: Arc<dyn RealtimeChannel>, names: HubNames) -> Arc<Self> {
        let registry = Arc::new(Self {
            channel,
            names,
            rooms: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
        });

        let handle = tokio::spawn(watch_reconnects(
            Arc::downgrade(&registry),
            registry.channel.connection_events(),
        ));
        *registry.watcher.lock() = Some(handle);

        registry
    }

    /// 共享的实时通道
    pub fn channel(&self) -> &Arc<dyn RealtimeChannel> {
        &self.channel
    }

    pub fn names(&self) -> &HubNames {
        &self.names
    }

    /// 加入会话房间（引用计数）
    pub async fn join(&self, key: &ConversationKey) -> Result<()> {
        let first = {
            let mut rooms = self.rooms.lock();
            let count = rooms.entry(key.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if !first {
            tracing::debug!("[Rooms] 房间已加入，增加引用: {}", key);
            return Ok(());
        }

        match self
            .channel
            .invoke(&self.names.join_method, vec![key.to_wire()])
            .await
        {
            Ok(_) => {
                tracing::info!("[Rooms] 已加入房间: {}", key);
                Ok(())
            }
            Err(e) => {
                self.release(key);
                tracing::warn!("[Rooms] 加入房间失败: {} ({})", key, e);
                Err(e)
            }
        }
    }

    /// 离开会话房间（引用计数）
    pub async fn leave(&self, key: &ConversationKey) -> Result<()> {
        if !self.release(key) {
            return Ok(());
        }

        self.channel
            .invoke(&self.names.leave_method, vec![key.to_wire()])
            .await
            .map(|_| tracing::info!("[Rooms] 已离开房间: {}", key))
            .inspect_err(|e| tracing::warn!("[Rooms] 离开房间失败: {} ({})", key, e))
    }

    /// 当前引用计数
    pub fn ref_count(&self, key: &ConversationKey) -> usize {
        self.rooms.lock().get(key).copied().unwrap_or(0)
    }

    /// 重新加入所有仍被引用的房间
    pub async fn rejoin_all(&self) {
        let keys: Vec<ConversationKey> = self.rooms.lock().keys().cloned().collect();
        for key in keys {
            if let Err(e) = self
                .channel
                .invoke(&self.names.join_method, vec![key.to_wire()])
                .await
            {
                tracing::warn!("[Rooms] 重连后重新加入失败: {} ({})", key, e);
            }
        }
    }

    /// 减少引用，计数归零时移除并返回 true
    fn release(&self, key: &ConversationKey) -> bool {
        let mut rooms = self.rooms.lock();
        match rooms.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                rooms.remove(key);
                true
            }
            None => false,
        }
    }
}

impl Drop for RoomRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}

async fn watch_reconnects(
    registry: Weak<RoomRegistry>,
    mut events: tokio::sync::broadcast::Receiver<ConnectionState>,
) {
    loop {
        match events.recv().await {
            Ok(ConnectionState::Reconnected) => {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                tracing::info!("[Rooms] 连接已恢复，重新加入房间");
                registry.rejoin_all().await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("[Rooms] 连接事件滞后 {} 条", skipped);
            }
            Err(RecvError::Closed) => return,
        }
    }
}
