//! 消息工作集
//!
//! 单个会话已加载的消息，始终满足：
//! - 同一 ID 至多一条
//! - 按 (发送时间, ID) 升序
//! - 布局（日期分隔位置）只在成员变化时重算

use chrono::FixedOffset;
use std::collections::HashSet;

use crate::model::{
    DisplayItem, LayoutRow, Message, MessageId, Reaction, ReactionId, compute_layout, render,
};

pub struct MessageWindow {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    layout: Vec<LayoutRow>,
    offset: FixedOffset,
}

impl MessageWindow {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            messages: Vec::new(),
            ids: HashSet::new(),
            layout: Vec::new(),
            offset,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.ids.contains(&id)
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        if !self.contains(id) {
            return None;
        }
        self.messages.iter().find(|m| m.id == id)
    }

    /// 插入单条消息；ID 已存在时忽略并返回 false
    pub fn insert(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        let key = message.sort_key();
        let position = self.messages.partition_point(|m| m.sort_key() < key);
        self.messages.insert(position, message);
        self.relayout();
        true
    }

    /// 合并一批消息（只补充不覆盖），返回实际插入的数量
    pub fn merge(&mut self, incoming: Vec<Message>) -> usize {
        let mut inserted = 0;
        for message in incoming {
            if self.ids.insert(message.id) {
                self.messages.push(message);
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.messages.sort_by_key(|m| m.sort_key());
            self.relayout();
        }
        inserted
    }

    /// 替换正文；不改变成员，不重算布局
    pub fn apply_edit(&mut self, id: MessageId, content: String) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.content = content;
                message.edited = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: MessageId) -> bool {
        if !self.ids.remove(&id) {
            return false;
        }
        self.messages.retain(|m| m.id != id);
        self.relayout();
        true
    }

    pub fn add_reaction(&mut self, reaction: Reaction) -> bool {
        match self.get_mut(reaction.message_id) {
            Some(message) => message.add_reaction(reaction),
            None => false,
        }
    }

    pub fn remove_reaction(&mut self, message_id: MessageId, reaction_id: ReactionId) -> bool {
        match self.get_mut(message_id) {
            Some(message) => message.remove_reaction(reaction_id),
            None => false,
        }
    }

    pub fn has_reaction(&self, message_id: MessageId, reaction_id: ReactionId) -> bool {
        self.get(message_id)
            .is_some_and(|m| m.reactions.iter().any(|r| r.id == reaction_id))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
        self.layout.clear();
    }

    /// 物化展示序列
    pub fn render(&self, self_user_id: &str, label_format: &str) -> Vec<DisplayItem> {
        render(&self.messages, &self.layout, self_user_id, label_format)
    }

    fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        if !self.contains(id) {
            return None;
        }
        self.messages.iter_mut().find(|m| m.id == id)
    }

    fn relayout(&mut self) {
        self.layout = compute_layout(&self.messages, &self.offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConversationKey;
    use chrono::{TimeZone, Utc};

    fn message(id: MessageId, day: u32, minute: u32) -> Message {
        Message {
            id,
            content: format!("msg{}", id),
            send_time: Utc.with_ymd_and_hms(2024, 5, day, 10, minute, 0).unwrap(),
            sender_id: "me".to_string(),
            conversation_key: ConversationKey::channel("1"),
            parent_id: None,
            attachments: vec![],
            reactions: vec![],
            edited: false,
        }
    }

    fn window() -> MessageWindow {
        MessageWindow::new(FixedOffset::east_opt(0).unwrap())
    }

    fn ids(window: &MessageWindow) -> Vec<MessageId> {
        window.messages.iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_insert_keeps_order_regardless_of_arrival() {
        let mut w = window();
        assert!(w.insert(message(3, 1, 30)));
        assert!(w.insert(message(1, 1, 10)));
        assert!(w.insert(message(2, 1, 20)));
        assert_eq!(ids(&w), vec![1, 2, 3]);
    }

    #[test]
    fn test_equal_timestamps_ordered_by_id() {
        let mut w = window();
        w.insert(message(9, 1, 10));
        w.insert(message(4, 1, 10));
        assert_eq!(ids(&w), vec![4, 9]);
    }

    #[test]
    fn test_merge_does_not_overwrite_existing() {
        let mut w = window();
        let mut edited = message(1, 1, 10);
        edited.content = "edited".to_string();
        w.insert(edited);

        let inserted = w.merge(vec![message(1, 1, 10), message(2, 1, 5)]);
        assert_eq!(inserted, 1);
        assert_eq!(ids(&w), vec![2, 1]);
        assert_eq!(w.get(1).unwrap().content, "edited");
    }

    #[test]
    fn test_edit_keeps_layout_and_remove_relayouts() {
        let mut w = window();
        w.merge(vec![message(1, 1, 0), message(2, 2, 0)]);
        let before = w.layout.clone();
        assert_eq!(before.len(), 4);

        assert!(w.apply_edit(2, "changed".to_string()));
        assert_eq!(w.layout, before);
        assert!(w.get(2).unwrap().edited);

        assert!(w.remove(1));
        assert_eq!(w.layout.len(), 2);
        assert!(!w.remove(1));
        assert!(!w.apply_edit(1, "gone".to_string()));
    }

    #[test]
    fn test_reactions_on_missing_message_are_ignored() {
        let mut w = window();
        w.insert(message(1, 1, 0));
        let reaction = Reaction {
            id: 5,
            content: "🎉".to_string(),
            message_id: 2,
            sender_id: "bob".to_string(),
        };
        assert!(!w.add_reaction(reaction.clone()));
        assert!(w.add_reaction(Reaction {
            message_id: 1,
            ..reaction
        }));
        assert!(w.has_reaction(1, 5));
        assert!(w.remove_reaction(1, 5));
        assert!(!w.remove_reaction(1, 5));
    }
}
