//! 展示序列与按日分组
//!
//! 日期分隔项由消息集合推导，从不单独存储：
//! - `compute_layout`: 在成员变化（插入/删除）时重算分隔位置
//! - `render`: 用当前消息内容把布局物化为展示序列
//!
//! 纯内容编辑只需重新 `render`，不会改变分隔项

use chrono::{FixedOffset, NaiveDate};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;

use super::types::{Message, MessageId};

/// 布局行：分隔项或消息在工作集中的下标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutRow {
    Separator(NaiveDate),
    Message(usize),
}

/// 展示用的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub message: Message,
    /// 是否为当前用户发送
    pub is_own: bool,
    /// 被回复消息的正文（不在已加载窗口内时为空）
    pub parent_preview: Option<String>,
}

/// 展示项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DisplayItem {
    /// 日期分隔
    Separator { date: NaiveDate, label: String },
    Message(MessageView),
}

impl DisplayItem {
    pub fn as_message(&self) -> Option<&MessageView> {
        match self {
            DisplayItem::Message(view) => Some(view),
            DisplayItem::Separator { .. } => None,
        }
    }
}

/// 默认的日期标签格式
pub const DEFAULT_DAY_LABEL_FORMAT: &str = "%Y-%m-%d";

/// 按 strftime 格式渲染日期标签
///
/// 格式中含有日期无法渲染的项（如 `%H`）或无效项时返回 None
pub fn format_day_label(date: NaiveDate, format: &str) -> Option<String> {
    let mut label = String::new();
    write!(label, "{}", date.format(format)).ok()?;
    Some(label)
}

/// 消息所在的日期（按给定时区）
pub fn local_date(message: &Message, offset: &FixedOffset) -> NaiveDate {
    message.send_time.with_timezone(offset).date_naive()
}

/// 计算布局：第一条消息前、以及跨日的相邻消息之间各插入一个分隔项
///
/// `messages` 必须已按发送时间升序
pub fn compute_layout(messages: &[Message], offset: &FixedOffset) -> Vec<LayoutRow> {
    let mut rows = Vec::with_capacity(messages.len() + 4);
    let mut current_day: Option<NaiveDate> = None;

    for (index, message) in messages.iter().enumerate() {
        let day = local_date(message, offset);
        if current_day != Some(day) {
            rows.push(LayoutRow::Separator(day));
            current_day = Some(day);
        }
        rows.push(LayoutRow::Message(index));
    }

    rows
}

/// 用当前消息内容物化展示序列
pub fn render(
    messages: &[Message],
    layout: &[LayoutRow],
    self_user_id: &str,
    label_format: &str,
) -> Vec<DisplayItem> {
    let contents: HashMap<MessageId, &str> = messages
        .iter()
        .map(|m| (m.id, m.content.as_str()))
        .collect();

    layout
        .iter()
        .filter_map(|row| match *row {
            LayoutRow::Separator(date) => Some(DisplayItem::Separator {
                date,
                label: format_day_label(date, label_format).unwrap_or_else(|| {
                    tracing::warn!("[Grouping] 日期标签格式无效，使用默认格式: {}", label_format);
                    date.format(DEFAULT_DAY_LABEL_FORMAT).to_string()
                }),
            }),
            LayoutRow::Message(index) => messages.get(index).map(|message| {
                DisplayItem::Message(MessageView {
                    is_own: message.sender_id == self_user_id,
                    parent_preview: message
                        .parent_id
                        .and_then(|parent| contents.get(&parent))
                        .map(|content| content.to_string()),
                    message: message.clone(),
                })
            }),
        })
        .collect()
}
