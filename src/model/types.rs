//! 消息数据类型定义
//!
//! 定义同步层工作集使用的数据结构，包括：
//! - `ConversationKey`: 会话标识（私聊对端用户 / 频道）
//! - `Message`: 已被服务器确认的消息
//! - `Reaction`: 表情回应
//!
//! 进入工作集的数据都已经过 `wire` 模块校验，这里的字段不再是可选的

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

/// 服务器分配的消息 ID
pub type MessageId = i64;

/// 服务器分配的表情回应 ID
pub type ReactionId = i64;

/// 会话标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ConversationKey {
    /// 私聊，值为对端用户 ID
    Direct(String),
    /// 频道，值为频道 ID
    Channel(String),
}

impl ConversationKey {
    pub fn direct(peer_id: impl Into<String>) -> Self {
        ConversationKey::Direct(peer_id.into())
    }

    pub fn channel(channel_id: impl Into<String>) -> Self {
        ConversationKey::Channel(channel_id.into())
    }

    /// 对端用户 ID 或频道 ID
    pub fn id(&self) -> &str {
        match self {
            ConversationKey::Direct(id) | ConversationKey::Channel(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConversationKey::Direct(_) => "direct",
            ConversationKey::Channel(_) => "channel",
        }
    }

    /// Hub 调用参数形式
    pub fn to_wire(&self) -> Value {
        json!({ "kind": self.kind(), "id": self.id() })
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// 表情回应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: ReactionId,
    /// 表情
    pub content: String,
    pub message_id: MessageId,
    pub sender_id: String,
}

/// 已确认的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// 正文，纯附件消息可为空
    pub content: String,
    /// 服务器发送时间，排序和按日分组的依据
    pub send_time: DateTime<Utc>,
    pub sender_id: String,
    pub conversation_key: ConversationKey,
    /// 回复的消息 ID，展示时在已加载窗口内解析
    pub parent_id: Option<MessageId>,
    /// 附件引用（按顺序）
    pub attachments: Vec<String>,
    pub reactions: Vec<Reaction>,
    /// 是否被编辑过
    pub edited: bool,
}

impl Message {
    /// 排序键：发送时间，时间相同按 ID
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.send_time, self.id)
    }

    /// 按回应 ID 追加，已存在返回 false
    pub fn add_reaction(&mut self, reaction: Reaction) -> bool {
        if self.reactions.iter().any(|r| r.id == reaction.id) {
            return false;
        }
        self.reactions.push(reaction);
        true
    }

    /// 按回应 ID 移除，不存在返回 false
    pub fn remove_reaction(&mut self, reaction_id: ReactionId) -> bool {
        let before = self.reactions.len();
        self.reactions.retain(|r| r.id != reaction_id);
        self.reactions.len() != before
    }
}
