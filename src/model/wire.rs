//! 服务器消息记录与校验边界
//!
//! REST 接口和 Hub 推送的 JSON 记录先反序列化为宽松的 `Raw*` 结构，
//! 再经 `into_message` / `into_reaction` 校验为工作集类型。
//! 校验失败的记录在边界处被拒绝，不会进入工作集。
//!
//! ## 兼容的字段形式
//!
//! - ID 类字段可以是数字或字符串
//! - 发送时间支持 RFC 3339、无时区的 ISO 时间（按 UTC 处理）、
//!   `YYYY-MM-DD HH:MM:SS`、以及 Unix 秒/毫秒时间戳
//! - 附件可以是字符串引用，也可以是带 `id`/`url` 的对象

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{ConversationKey, Message, MessageId, Reaction, ReactionId};
use crate::error::{Result, SyncError};

/// 毫秒时间戳的下限，小于该值视为秒
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// 服务器消息记录
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "sendTime")]
    pub send_timestamp: Option<Value>,
    #[serde(default)]
    pub sender_id: Option<Value>,
    #[serde(default)]
    pub receiver_id: Option<Value>,
    #[serde(default)]
    pub channel_id: Option<Value>,
    #[serde(default)]
    pub parent_id: Option<Value>,
    #[serde(default)]
    pub attachments: Option<Vec<Value>>,
    /// 逐条校验，单条格式错误的回应不影响消息本身
    #[serde(default)]
    pub reactions: Option<Vec<Value>>,
    #[serde(default, alias = "isEdited")]
    pub edited: Option<bool>,
}

/// 服务器表情回应记录
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReaction {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, alias = "emoji")]
    pub content: Option<String>,
    #[serde(default)]
    pub message_id: Option<Value>,
    #[serde(default)]
    pub sender_id: Option<Value>,
}

/// 发送消息请求体
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    pub attachment_ids: Vec<String>,
}

impl NewMessage {
    pub fn new(
        key: &ConversationKey,
        content: impl Into<String>,
        parent_id: Option<MessageId>,
        attachment_ids: Vec<String>,
    ) -> Self {
        let (receiver_id, channel_id) = match key {
            ConversationKey::Direct(peer) => (Some(peer.clone()), None),
            ConversationKey::Channel(channel) => (None, Some(channel.clone())),
        };
        Self {
            content: content.into(),
            receiver_id,
            channel_id,
            parent_id,
            attachment_ids,
        }
    }
}

impl RawMessage {
    /// 校验为工作集消息
    ///
    /// `self_user_id` 用于确定私聊会话的对端：自己发出的消息对端是接收者，
    /// 否则对端是发送者
    pub fn into_message(self, self_user_id: &str) -> Result<Message> {
        let id = self
            .id
            .as_ref()
            .and_then(value_to_i64)
            .ok_or_else(|| SyncError::InvalidRecord("缺少消息 id".to_string()))?;

        let send_time = self
            .send_timestamp
            .as_ref()
            .ok_or_else(|| SyncError::InvalidRecord(format!("消息 {} 缺少发送时间", id)))
            .and_then(parse_timestamp)?;

        let sender_id = self
            .sender_id
            .as_ref()
            .and_then(value_to_string)
            .ok_or_else(|| SyncError::InvalidRecord(format!("消息 {} 缺少发送者", id)))?;

        let conversation_key = match self.channel_id.as_ref().and_then(value_to_string) {
            Some(channel) => ConversationKey::Channel(channel),
            None => {
                let receiver = self.receiver_id.as_ref().and_then(value_to_string);
                let peer = if sender_id == self_user_id {
                    receiver
                } else {
                    Some(sender_id.clone())
                };
                ConversationKey::Direct(peer.ok_or_else(|| {
                    SyncError::InvalidRecord(format!("消息 {} 无法确定所属会话", id))
                })?)
            }
        };

        let parent_id = match self.parent_id {
            None | Some(Value::Null) => None,
            Some(ref value) => Some(value_to_i64(value).ok_or_else(|| {
                SyncError::InvalidRecord(format!("消息 {} 的 parentId 无效", id))
            })?),
        };

        let attachments = self
            .attachments
            .unwrap_or_default()
            .iter()
            .filter_map(attachment_reference)
            .collect();

        let mut message = Message {
            id,
            content: self.content.unwrap_or_default(),
            send_time,
            sender_id,
            conversation_key,
            parent_id,
            attachments,
            reactions: Vec::new(),
            edited: self.edited.unwrap_or(false),
        };

        for value in self.reactions.unwrap_or_default() {
            let parsed = serde_json::from_value::<RawReaction>(value)
                .map_err(SyncError::from)
                .and_then(|raw| raw.into_reaction(Some(id)));
            match parsed {
                Ok(reaction) => {
                    message.add_reaction(reaction);
                }
                Err(e) => tracing::warn!("[Wire] 丢弃无效的表情回应: {}", e),
            }
        }

        Ok(message)
    }
}

impl RawReaction {
    /// 校验为表情回应；记录中缺少 messageId 时使用 `message_id`
    pub fn into_reaction(self, message_id: Option<MessageId>) -> Result<Reaction> {
        let id = self
            .id
            .as_ref()
            .and_then(value_to_i64)
            .ok_or_else(|| SyncError::InvalidRecord("缺少回应 id".to_string()))?;

        let message_id = self
            .message_id
            .as_ref()
            .and_then(value_to_i64)
            .or(message_id)
            .ok_or_else(|| SyncError::InvalidRecord(format!("回应 {} 缺少 messageId", id)))?;

        let content = self
            .content
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SyncError::InvalidRecord(format!("回应 {} 缺少表情", id)))?;

        let sender_id = self
            .sender_id
            .as_ref()
            .and_then(value_to_string)
            .ok_or_else(|| SyncError::InvalidRecord(format!("回应 {} 缺少发送者", id)))?;

        Ok(Reaction {
            id,
            content,
            message_id,
            sender_id,
        })
    }
}

/// 把一页 JSON 记录逐条反序列化，字段类型错误的记录被丢弃
pub fn decode_records(values: Vec<Value>) -> Vec<RawMessage> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<RawMessage>(value) {
            Ok(raw) => Some(raw),
            Err(e) => {
                tracing::warn!("[Wire] 丢弃无法解码的消息记录: {}", e);
                None
            }
        })
        .collect()
}

/// 解析一页历史记录，无效记录被丢弃
pub fn parse_page(records: Vec<RawMessage>, self_user_id: &str) -> Vec<Message> {
    records
        .into_iter()
        .filter_map(|raw| match raw.into_message(self_user_id) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!("[Wire] 丢弃无效的消息记录: {}", e);
                None
            }
        })
        .collect()
}

/// 解析 Hub 推送的消息参数
pub fn parse_message_value(value: &Value, self_user_id: &str) -> Result<Message> {
    let raw: RawMessage = serde_json::from_value(value.clone())?;
    raw.into_message(self_user_id)
}

/// 解析 Hub 推送的表情回应参数
pub fn parse_reaction_value(value: &Value) -> Result<Reaction> {
    let raw: RawReaction = serde_json::from_value(value.clone())?;
    raw.into_reaction(None)
}

/// 从删除事件参数中取出消息 ID：`42`、`"42"`、`{"id": 42}` 或 `{"messageId": 42}`
pub fn parse_message_id(value: &Value) -> Option<MessageId> {
    match value {
        Value::Object(map) => map
            .get("id")
            .or_else(|| map.get("messageId"))
            .and_then(value_to_i64),
        other => value_to_i64(other),
    }
}

/// 从回应移除事件参数中取出 (消息 ID, 回应 ID)
///
/// 支持 `[messageId, reactionId]` 两个参数，或单个 `{"id", "messageId"}` 对象
pub fn parse_reaction_removal(args: &[Value]) -> Option<(MessageId, ReactionId)> {
    match args {
        [Value::Object(map)] => {
            let reaction_id = map.get("id").and_then(value_to_i64)?;
            let message_id = map.get("messageId").and_then(value_to_i64)?;
            Some((message_id, reaction_id))
        }
        [message_id, reaction_id, ..] => {
            Some((value_to_i64(message_id)?, value_to_i64(reaction_id)?))
        }
        _ => None,
    }
}

/// 归一化发送时间
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    let parsed = match value {
        Value::String(text) => parse_time_str(text.trim()),
        Value::Number(number) => number.as_i64().and_then(|n| {
            if n.abs() >= MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(n).single()
            } else {
                Utc.timestamp_opt(n, 0).single()
            }
        }),
        _ => None,
    };

    parsed.ok_or_else(|| SyncError::InvalidRecord(format!("无法解析的时间: {}", value)))
}

fn parse_time_str(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    // 服务器有时返回不带时区的时间，按 UTC 处理
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn attachment_reference(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map
            .get("url")
            .or_else(|| map.get("id"))
            .and_then(value_to_string),
        other => value_to_string(other),
    }
}
