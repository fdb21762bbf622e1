//! 测试用的内存实现：`FakeApi` 和 `FakeChannel`

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::{Notify, broadcast};

use super::ConversationSynchronizer;
use crate::api::MessageApi;
use crate::config::{HubNames, SyncConfig};
use crate::error::{Result, SyncError};
use crate::model::{
    ConversationKey, MessageId, NewMessage, RawMessage, RawReaction, ReactionId, decode_records,
};
use crate::realtime::{
    ConnectionState, EventHandler, HandlerId, HandlerTable, RealtimeChannel, RoomRegistry,
};
use crate::session::SessionContext;

/// 构造一条频道消息记录
pub fn record(id: MessageId, send_time: &str, sender: &str, channel: &str) -> Value {
    json!({
        "id": id,
        "content": format!("message {}", id),
        "sendTimestamp": send_time,
        "senderId": sender,
        "channelId": channel,
    })
}

/// 当前用户为 `me` 的同步器、接口和通道
pub fn harness() -> (ConversationSynchronizer, Arc<FakeApi>, Arc<FakeChannel>) {
    let api = FakeApi::new("me");
    let channel = FakeChannel::new();
    let rooms = RoomRegistry::new(channel.clone(), HubNames::default());
    let sync = ConversationSynchronizer::new(
        api.clone(),
        rooms,
        SessionContext::new("me", "http://localhost", "token"),
        SyncConfig::default(),
    )
    .unwrap();
    (sync, api, channel)
}

fn offline_error() -> SyncError {
    SyncError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "offline"))
}

// ============================================================================
// FakeApi
// ============================================================================

pub struct FakeApi {
    user_id: String,
    pages: Mutex<HashMap<(ConversationKey, u32), Vec<Value>>>,
    offline: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    last_page_size: Mutex<Option<u32>>,
    next_id: AtomicI64,
    now: Mutex<String>,
}

impl FakeApi {
    pub fn new(user_id: &str) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.to_string(),
            pages: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            gate: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
            last_page_size: Mutex::new(None),
            next_id: AtomicI64::new(1000),
            now: Mutex::new("2024-05-01T12:00:00Z".to_string()),
        })
    }

    pub fn set_page(&self, key: &ConversationKey, page: u32, records: Vec<Value>) {
        self.pages.lock().insert((key.clone(), page), records);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// 服务器分配的发送时间
    pub fn set_now(&self, now: &str) {
        *self.now.lock() = now.to_string();
    }

    /// 之后的历史请求在返回前等待放行
    pub fn hold_fetches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    /// 最近一次历史请求的页大小
    pub fn last_page_size(&self) -> Option<u32> {
        *self.last_page_size.lock()
    }

    fn record_call(&self, method: &'static str) {
        *self.calls.lock().entry(method).or_insert(0) += 1;
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(offline_error());
        }
        Ok(())
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageApi for FakeApi {
    async fn fetch_page(
        &self,
        key: &ConversationKey,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RawMessage>> {
        self.record_call("fetch_page");
        *self.last_page_size.lock() = Some(page_size);
        self.check_online()?;

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let records = self
            .pages
            .lock()
            .get(&(key.clone(), page))
            .cloned()
            .unwrap_or_default();
        Ok(decode_records(records))
    }

    async fn post_message(&self, message: &NewMessage) -> Result<RawMessage> {
        self.record_call("post_message");
        self.check_online()?;

        let value = json!({
            "id": self.next_id(),
            "content": message.content,
            "sendTimestamp": self.now.lock().clone(),
            "senderId": self.user_id,
            "receiverId": message.receiver_id,
            "channelId": message.channel_id,
            "parentId": message.parent_id,
            "attachments": message.attachment_ids,
        });
        Ok(serde_json::from_value(value)?)
    }

    async fn edit_message(&self, id: MessageId, content: &str) -> Result<RawMessage> {
        self.record_call("edit_message");
        self.check_online()?;

        let value = json!({
            "id": id,
            "content": content,
            "sendTimestamp": self.now.lock().clone(),
            "senderId": self.user_id,
            "channelId": "0",
            "isEdited": true,
        });
        Ok(serde_json::from_value(value)?)
    }

    async fn delete_message(&self, _id: MessageId) -> Result<()> {
        self.record_call("delete_message");
        self.check_online()
    }

    async fn add_reaction(&self, message_id: MessageId, emoji: &str) -> Result<RawReaction> {
        self.record_call("add_reaction");
        self.check_online()?;

        let value = json!({
            "id": self.next_id(),
            "content": emoji,
            "messageId": message_id,
            "senderId": self.user_id,
        });
        Ok(serde_json::from_value(value)?)
    }

    async fn remove_reaction(&self, _message_id: MessageId, _reaction_id: ReactionId) -> Result<()> {
        self.record_call("remove_reaction");
        self.check_online()
    }

    async fn resolve_attachment(&self, reference: &str) -> Result<String> {
        self.record_call("resolve_attachment");
        if reference.starts_with("bad") {
            return Err(SyncError::Api {
                status: 404,
                message: format!("附件不存在: {}", reference),
            });
        }
        Ok(format!("https://cdn.test/{}", reference))
    }
}

// ============================================================================
// FakeChannel
// ============================================================================

pub struct FakeChannel {
    handlers: HandlerTable,
    invocations: Mutex<Vec<String>>,
    offline: AtomicBool,
    state_tx: broadcast::Sender<ConnectionState>,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        let (state_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            handlers: HandlerTable::new(),
            invocations: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            state_tx,
        })
    }

    /// 离线时所有调用返回 `NotConnected`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// 成功调用某方法的次数
    pub fn invocations(&self, method: &str) -> usize {
        self.invocations
            .lock()
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }

    /// 模拟服务器推送，返回触发的处理器数量
    pub fn emit(&self, event: &str, args: Vec<Value>) -> usize {
        self.handlers.dispatch(event, &args)
    }

    pub fn emit_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.count(event)
    }
}

#[async_trait]
impl RealtimeChannel for FakeChannel {
    fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.handlers.add(event, handler)
    }

    fn off(&self, event: &str, id: HandlerId) {
        self.handlers.remove(event, id);
    }

    async fn invoke(&self, method: &str, _args: Vec<Value>) -> Result<Value> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }
        self.invocations.lock().push(method.to_string());
        Ok(Value::Null)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn state(&self) -> ConnectionState {
        if self.offline.load(Ordering::SeqCst) {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        }
    }
}
