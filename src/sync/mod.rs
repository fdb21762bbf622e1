/*!
 * 会话同步模块
 *
 * 把 REST 历史分页和实时推送合并为一个有序、去重、按日分组的消息序列。
 *
 * 模块结构：
 * - window: 消息工作集（去重、排序、布局缓存）
 * - synchronizer: 会话同步器（订阅状态机、历史加载、实时事件、本地操作）
 *
 * 观察者模式：
 * - 拉取：`ConversationSynchronizer::snapshot()` 返回当前展示序列
 * - 推送：`ConversationSynchronizer::updates()` 订阅 `SyncEvent`
 *
 * 更新日志：
 * - 发送/编辑/删除统一采用服务器确认后再写入工作集，不再插入乐观条目
 * - 切换会话时取消进行中的历史请求，迟到的分页按代次丢弃
 */

pub mod synchronizer;
pub mod window;

#[cfg(test)]
pub mod testing;

use serde::{Deserialize, Serialize};

use crate::model::{ConversationKey, MessageId};
use crate::realtime::ConnectionState;

pub use synchronizer::ConversationSynchronizer;
pub use window::MessageWindow;

/// 订阅状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Unsubscribed,
    /// 已激活会话，正在加入房间
    Subscribing,
    Subscribed,
}

/// 历史加载结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// 已合并到工作集
    Applied {
        /// 新插入的条数（已存在的 ID 不计）
        inserted: usize,
        /// 本页通过校验的条数
        received: usize,
    },
    /// 请求期间会话已切换，分页被丢弃
    Discarded,
}

/// 同步事件（推送给观察者）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// 工作集被清空（切换或取消订阅），`key` 为新的活动会话
    Reset { key: Option<ConversationKey> },
    HistoryMerged { inserted: usize },
    MessageInserted { id: MessageId },
    MessageUpdated { id: MessageId },
    MessageRemoved { id: MessageId },
    ReactionsChanged { id: MessageId },
    /// 共享连接状态变化
    Connection { state: ConnectionState },
}
