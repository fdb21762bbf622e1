//! 会话同步器
//!
//! 每个同步器同一时间只跟踪一个活动会话。
//!
//! ## 并发模型
//!
//! 工作集由 `parking_lot::Mutex` 保护，锁从不跨越 await。
//! 实时事件和本地操作的后续处理可以任意交错，正确性只依赖按 ID 去重。
//!
//! 每次激活会话都分配新的代次和 `CancellationToken`：
//! - 切换会话时取消旧令牌，进行中的历史请求立即返回 `Discarded`
//! - 迟到的结果在写入前比对代次，不一致则丢弃

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::window::MessageWindow;
use super::{LoadOutcome, SubscriptionState, SyncEvent};
use crate::api::MessageApi;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::model::wire::{
    parse_message_id, parse_message_value, parse_page, parse_reaction_removal,
    parse_reaction_value,
};
use crate::model::{
    ConversationKey, DisplayItem, Message, MessageId, NewMessage, Reaction, ReactionId,
};
use crate::realtime::{ConnectionState, EventHandler, HandlerId, RoomRegistry};
use crate::session::SessionContext;

// ============================================================================
// 内部状态
// ============================================================================

/// 一次会话激活
struct Activation {
    key: ConversationKey,
    generation: u64,
    subscription: SubscriptionState,
    cancel: CancellationToken,
}

struct SyncState {
    active: Option<Activation>,
    next_generation: u64,
    window: MessageWindow,
}

impl SyncState {
    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }

    fn is_active_key(&self, key: &ConversationKey) -> bool {
        self.active.as_ref().is_some_and(|a| a.key == *key)
    }
}

struct Inner {
    api: Arc<dyn MessageApi>,
    rooms: Arc<RoomRegistry>,
    session: SessionContext,
    config: SyncConfig,
    state: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
    /// 已注册的 Hub 事件处理器
    handlers: Mutex<Vec<(String, HandlerId)>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }

        let channel = self.rooms.channel();
        for (event, id) in self.handlers.lock().drain(..) {
            channel.off(&event, id);
        }

        // 仍处于订阅中的房间交给运行时异步离开
        let Some(active) = self.state.lock().active.take() else {
            return;
        };
        active.cancel.cancel();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let rooms = self.rooms.clone();
                handle.spawn(async move {
                    if let Err(e) = rooms.leave(&active.key).await {
                        tracing::warn!("[Sync] 释放时离开房间失败: {} ({})", active.key, e);
                    }
                });
            }
            Err(_) => {
                tracing::debug!("[Sync] 无运行时，跳过离开房间: {}", active.key);
            }
        }
    }
}

// ============================================================================
// 会话同步器
// ============================================================================

/// 会话同步器（克隆共享同一份状态）
#[derive(Clone)]
pub struct ConversationSynchronizer {
    inner: Arc<Inner>,
}

impl ConversationSynchronizer {
    /// 创建同步器（需在 tokio 运行时内调用）
    pub fn new(
        api: Arc<dyn MessageApi>,
        rooms: Arc<RoomRegistry>,
        session: SessionContext,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let offset = config
            .day_offset()
            .ok_or_else(|| SyncError::Config("dayOffsetMinutes 超出范围".to_string()))?;
        let (events, _) = broadcast::channel(config.event_buffer_size.max(1));

        let inner = Arc::new(Inner {
            api,
            rooms,
            session,
            config,
            state: Mutex::new(SyncState {
                active: None,
                next_generation: 0,
                window: MessageWindow::new(offset),
            }),
            events,
            handlers: Mutex::new(Vec::new()),
            forwarder: Mutex::new(None),
        });

        let handle = tokio::spawn(forward_connection_events(
            Arc::downgrade(&inner),
            inner.rooms.channel().connection_events(),
        ));
        *inner.forwarder.lock() = Some(handle);

        Ok(Self { inner })
    }

    // ------------------------------------------------------------------------
    // 查询
    // ------------------------------------------------------------------------

    /// 订阅同步事件
    pub fn updates(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// 当前展示序列
    pub fn snapshot(&self) -> Vec<DisplayItem> {
        let state = self.inner.state.lock();
        if state.window.is_empty() {
            return Vec::new();
        }
        state.window.render(
            &self.inner.session.user_id,
            &self.inner.config.day_label_format,
        )
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .map(|a| a.subscription)
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    pub fn active_key(&self) -> Option<ConversationKey> {
        self.inner.state.lock().active.as_ref().map(|a| a.key.clone())
    }

    pub fn message_count(&self) -> usize {
        self.inner.state.lock().window.len()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.inner.state.lock().window.contains(id)
    }

    // ------------------------------------------------------------------------
    // 订阅
    // ------------------------------------------------------------------------

    /// 订阅会话
    ///
    /// 已是活动会话时为空操作；否则切换：离开旧房间、取消旧请求、清空工作集、加入新房间
    pub async fn subscribe(&self, key: &ConversationKey) -> Result<()> {
        let (generation, previous) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.is_active_key(key) {
                tracing::debug!("[Sync] 会话已激活，忽略重复订阅: {}", key);
                return Ok(());
            }

            let previous = state.active.take();
            if let Some(prev) = &previous {
                prev.cancel.cancel();
            }
            state.window.clear();
            state.next_generation += 1;
            state.active = Some(Activation {
                key: key.clone(),
                generation: state.next_generation,
                subscription: SubscriptionState::Subscribing,
                cancel: CancellationToken::new(),
            });
            (state.next_generation, previous.map(|p| p.key))
        };
        self.emit(SyncEvent::Reset {
            key: Some(key.clone()),
        });

        if let Some(previous) = previous {
            tracing::info!("[Sync] 切换会话: {} -> {}", previous, key);
            if let Err(e) = self.inner.rooms.leave(&previous).await {
                tracing::warn!("[Sync] 离开旧房间失败: {} ({})", previous, e);
            }
        }

        self.attach_handlers();

        match self.inner.rooms.join(key).await {
            Ok(()) => {
                let mut state = self.inner.state.lock();
                if let Some(active) = state
                    .active
                    .as_mut()
                    .filter(|a| a.generation == generation)
                {
                    active.subscription = SubscriptionState::Subscribed;
                    tracing::info!("[Sync] 已订阅会话: {}", key);
                }
                Ok(())
            }
            Err(e) => {
                let idle = {
                    let mut state = self.inner.state.lock();
                    if state.is_current(generation) {
                        state.active = None;
                        state.window.clear();
                    }
                    state.active.is_none()
                };
                if idle {
                    self.detach_handlers();
                    self.emit(SyncEvent::Reset { key: None });
                }
                tracing::warn!("[Sync] 订阅会话失败: {} ({})", key, e);
                Err(e)
            }
        }
    }

    /// 取消订阅；非活动会话为空操作
    pub async fn unsubscribe(&self, key: &ConversationKey) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if !state.is_active_key(key) {
                tracing::debug!("[Sync] 会话未激活，忽略取消订阅: {}", key);
                return Ok(());
            }
            if let Some(active) = state.active.take() {
                active.cancel.cancel();
            }
            state.window.clear();
        }

        self.detach_handlers();
        self.emit(SyncEvent::Reset { key: None });
        tracing::info!("[Sync] 已取消订阅会话: {}", key);

        self.inner.rooms.leave(key).await
    }

    // ------------------------------------------------------------------------
    // 历史
    // ------------------------------------------------------------------------

    /// 按配置的默认页大小加载一页历史
    pub async fn load_page(&self, key: &ConversationKey, page: u32) -> Result<LoadOutcome> {
        self.load_history(key, page, self.inner.config.default_page_size)
            .await
    }

    /// 加载一页历史并合并到工作集
    pub async fn load_history(
        &self,
        key: &ConversationKey,
        page: u32,
        page_size: u32,
    ) -> Result<LoadOutcome> {
        if page == 0 {
            return Err(SyncError::InvalidArgument("页码从 1 开始".to_string()));
        }
        let max_page_size = self.inner.config.max_page_size;
        if page_size == 0 || page_size > max_page_size {
            return Err(SyncError::InvalidArgument(format!(
                "pageSize 必须在 1..={} 之间: {}",
                max_page_size, page_size
            )));
        }

        let (generation, cancel) = {
            let state = self.inner.state.lock();
            match state.active.as_ref() {
                Some(active) if active.key == *key => (active.generation, active.cancel.clone()),
                _ => {
                    tracing::debug!("[Sync] 非活动会话的历史请求被忽略: {}", key);
                    return Ok(LoadOutcome::Discarded);
                }
            }
        };

        tracing::debug!("[Sync] 加载历史: {} 第 {} 页 (每页 {})", key, page, page_size);
        let records = tokio::select! {
            result = self.inner.api.fetch_page(key, page, page_size) => result?,
            _ = cancel.cancelled() => {
                tracing::debug!("[Sync] 会话已切换，取消历史请求: {}", key);
                return Ok(LoadOutcome::Discarded);
            }
        };

        let mut messages = parse_page(records, &self.inner.session.user_id);
        for message in &mut messages {
            message.conversation_key = key.clone();
        }
        let received = messages.len();

        let inserted = {
            let mut state = self.inner.state.lock();
            if !state.is_current(generation) {
                tracing::debug!("[Sync] 丢弃过期的历史分页: {}", key);
                return Ok(LoadOutcome::Discarded);
            }
            state.window.merge(messages)
        };

        tracing::info!(
            "[Sync] 历史已合并: {} 第 {} 页, 收到 {} 条, 新增 {} 条",
            key,
            page,
            received,
            inserted
        );
        self.emit(SyncEvent::HistoryMerged { inserted });

        Ok(LoadOutcome::Applied { inserted, received })
    }

    // ------------------------------------------------------------------------
    // 实时事件
    // ------------------------------------------------------------------------

    /// 新消息：不属于活动会话或 ID 已存在时丢弃
    pub fn on_live_message_created(&self, message: Message) -> bool {
        let id = message.id;
        if !self.insert_if_active(message) {
            return false;
        }
        tracing::debug!("[Sync] 实时插入消息: {}", id);
        self.emit(SyncEvent::MessageInserted { id });
        true
    }

    /// 消息编辑：按 ID 替换正文
    pub fn on_live_message_updated(&self, message: Message) -> bool {
        let id = message.id;
        let updated = self
            .inner
            .state
            .lock()
            .window
            .apply_edit(id, message.content);
        if updated {
            self.emit(SyncEvent::MessageUpdated { id });
        }
        updated
    }

    pub fn on_live_message_deleted(&self, id: MessageId) -> bool {
        let removed = self.inner.state.lock().window.remove(id);
        if removed {
            tracing::debug!("[Sync] 实时删除消息: {}", id);
            self.emit(SyncEvent::MessageRemoved { id });
        }
        removed
    }

    pub fn on_live_reaction_added(&self, reaction: Reaction) -> bool {
        let message_id = reaction.message_id;
        let added = self.inner.state.lock().window.add_reaction(reaction);
        if added {
            self.emit(SyncEvent::ReactionsChanged { id: message_id });
        }
        added
    }

    pub fn on_live_reaction_removed(&self, message_id: MessageId, reaction_id: ReactionId) -> bool {
        let removed = self
            .inner
            .state
            .lock()
            .window
            .remove_reaction(message_id, reaction_id);
        if removed {
            self.emit(SyncEvent::ReactionsChanged { id: message_id });
        }
        removed
    }

    // ------------------------------------------------------------------------
    // 本地操作
    // ------------------------------------------------------------------------

    /// 发送消息到活动会话
    ///
    /// 只在服务器确认后插入确认副本；实时回显到达时按 ID 去重
    pub async fn send_message(
        &self,
        text: &str,
        parent_id: Option<MessageId>,
        attachment_ids: Vec<String>,
    ) -> Result<Message> {
        let key = self
            .active_key()
            .ok_or_else(|| SyncError::InvalidArgument("没有活动会话".to_string()))?;

        let body = NewMessage::new(&key, text, parent_id, attachment_ids);
        let raw = self.inner.api.post_message(&body).await?;
        let mut message = raw.into_message(&self.inner.session.user_id)?;
        message.conversation_key = key;

        if self.insert_if_active(message.clone()) {
            tracing::debug!("[Sync] 已插入确认消息: {}", message.id);
            self.emit(SyncEvent::MessageInserted { id: message.id });
        }
        Ok(message)
    }

    /// 编辑消息；ID 不在工作集中时为空操作
    pub async fn edit_message(&self, id: MessageId, text: &str) -> Result<()> {
        let Some(sender_id) = self.sender_of(id) else {
            tracing::debug!("[Sync] 编辑的消息不在工作集中: {}", id);
            return Ok(());
        };
        debug_assert!(
            self.inner.session.is_self(&sender_id),
            "只能编辑自己发送的消息"
        );

        let raw = self.inner.api.edit_message(id, text).await?;
        let content = match raw.into_message(&self.inner.session.user_id) {
            Ok(confirmed) => confirmed.content,
            Err(e) => {
                tracing::warn!("[Sync] 编辑响应无效，使用本地正文: {}", e);
                text.to_string()
            }
        };

        if self.inner.state.lock().window.apply_edit(id, content) {
            self.emit(SyncEvent::MessageUpdated { id });
        }
        Ok(())
    }

    /// 删除消息；ID 不在工作集中时为空操作
    pub async fn delete_message(&self, id: MessageId) -> Result<()> {
        let Some(sender_id) = self.sender_of(id) else {
            tracing::debug!("[Sync] 删除的消息不在工作集中: {}", id);
            return Ok(());
        };
        debug_assert!(
            self.inner.session.is_self(&sender_id),
            "只能删除自己发送的消息"
        );

        self.inner.api.delete_message(id).await?;

        if self.inner.state.lock().window.remove(id) {
            self.emit(SyncEvent::MessageRemoved { id });
        }
        Ok(())
    }

    /// 添加表情回应；消息不在工作集中时为空操作
    pub async fn add_reaction(&self, message_id: MessageId, emoji: &str) -> Result<()> {
        if !self.contains(message_id) {
            tracing::debug!("[Sync] 回应的消息不在工作集中: {}", message_id);
            return Ok(());
        }

        let raw = self.inner.api.add_reaction(message_id, emoji).await?;
        let reaction = raw.into_reaction(Some(message_id))?;

        if self.inner.state.lock().window.add_reaction(reaction) {
            self.emit(SyncEvent::ReactionsChanged { id: message_id });
        }
        Ok(())
    }

    /// 移除表情回应；回应不存在时为空操作
    pub async fn remove_reaction(&self, message_id: MessageId, reaction_id: ReactionId) -> Result<()> {
        if !self
            .inner
            .state
            .lock()
            .window
            .has_reaction(message_id, reaction_id)
        {
            return Ok(());
        }

        self.inner.api.remove_reaction(message_id, reaction_id).await?;

        if self
            .inner
            .state
            .lock()
            .window
            .remove_reaction(message_id, reaction_id)
        {
            self.emit(SyncEvent::ReactionsChanged { id: message_id });
        }
        Ok(())
    }

    /// 并发解析消息的全部附件，失败的附件被省略
    pub async fn resolve_attachments(&self, message: &Message) -> Vec<String> {
        let api = &self.inner.api;
        let results = join_all(
            message
                .attachments
                .iter()
                .map(|reference| api.resolve_attachment(reference)),
        )
        .await;

        results
            .into_iter()
            .zip(&message.attachments)
            .filter_map(|(result, reference)| match result {
                Ok(uri) => Some(uri),
                Err(e) => {
                    tracing::warn!("[Sync] 附件解析失败: {} ({})", reference, e);
                    None
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // 内部方法
    // ------------------------------------------------------------------------

    fn emit(&self, event: SyncEvent) {
        // 没有观察者时发送失败，忽略
        let _ = self.inner.events.send(event);
    }

    fn sender_of(&self, id: MessageId) -> Option<String> {
        self.inner
            .state
            .lock()
            .window
            .get(id)
            .map(|m| m.sender_id.clone())
    }

    fn insert_if_active(&self, message: Message) -> bool {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if !state.is_active_key(&message.conversation_key) {
            tracing::debug!(
                "[Sync] 丢弃非活动会话的消息: {} ({})",
                message.id,
                message.conversation_key
            );
            return false;
        }
        state.window.insert(message)
    }

    /// 注册 Hub 事件处理器（已注册时跳过）
    fn attach_handlers(&self) {
        let mut handlers = self.inner.handlers.lock();
        if !handlers.is_empty() {
            return;
        }

        let names = self.inner.rooms.names();
        let channel = self.inner.rooms.channel();
        let weak = Arc::downgrade(&self.inner);

        let table: [(&String, fn(&ConversationSynchronizer, &[Value])); 5] = [
            (&names.message_created, Self::handle_created),
            (&names.message_updated, Self::handle_updated),
            (&names.message_deleted, Self::handle_deleted),
            (&names.reaction_added, Self::handle_reaction_added),
            (&names.reaction_removed, Self::handle_reaction_removed),
        ];
        for (event, apply) in table {
            let id = channel.on(event, live_handler(weak.clone(), apply));
            handlers.push((event.clone(), id));
        }
        tracing::debug!("[Sync] 已注册 {} 个事件处理器", handlers.len());
    }

    fn detach_handlers(&self) {
        let channel = self.inner.rooms.channel();
        for (event, id) in self.inner.handlers.lock().drain(..) {
            channel.off(&event, id);
        }
    }

    fn handle_created(&self, args: &[Value]) {
        let Some(value) = args.first() else {
            return;
        };
        match parse_message_value(value, &self.inner.session.user_id) {
            Ok(message) => {
                self.on_live_message_created(message);
            }
            Err(e) => tracing::warn!("[Sync] 丢弃无效的新消息事件: {}", e),
        }
    }

    fn handle_updated(&self, args: &[Value]) {
        let Some(value) = args.first() else {
            return;
        };
        match parse_message_value(value, &self.inner.session.user_id) {
            Ok(message) => {
                self.on_live_message_updated(message);
            }
            Err(e) => tracing::warn!("[Sync] 丢弃无效的编辑事件: {}", e),
        }
    }

    fn handle_deleted(&self, args: &[Value]) {
        match args.first().and_then(parse_message_id) {
            Some(id) => {
                self.on_live_message_deleted(id);
            }
            None => tracing::warn!("[Sync] 丢弃无效的删除事件: {:?}", args),
        }
    }

    fn handle_reaction_added(&self, args: &[Value]) {
        let Some(value) = args.first() else {
            return;
        };
        match parse_reaction_value(value) {
            Ok(reaction) => {
                self.on_live_reaction_added(reaction);
            }
            Err(e) => tracing::warn!("[Sync] 丢弃无效的回应事件: {}", e),
        }
    }

    fn handle_reaction_removed(&self, args: &[Value]) {
        match parse_reaction_removal(args) {
            Some((message_id, reaction_id)) => {
                self.on_live_reaction_removed(message_id, reaction_id);
            }
            None => tracing::warn!("[Sync] 丢弃无效的回应移除事件: {:?}", args),
        }
    }
}

/// 包装为 Hub 事件处理器；同步器释放后处理器自动失效
fn live_handler(inner: Weak<Inner>, apply: fn(&ConversationSynchronizer, &[Value])) -> EventHandler {
    Arc::new(move |args: &[Value]| {
        if let Some(inner) = inner.upgrade() {
            apply(&ConversationSynchronizer { inner }, args);
        }
    })
}

/// 把共享连接的状态变化转发给观察者
async fn forward_connection_events(
    inner: Weak<Inner>,
    mut events: broadcast::Receiver<ConnectionState>,
) {
    loop {
        match events.recv().await {
            Ok(state) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if state == ConnectionState::Reconnected {
                    tracing::info!("[Sync] 连接已恢复，历史不会自动补齐");
                }
                let _ = inner.events.send(SyncEvent::Connection { state });
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("[Sync] 连接事件滞后 {} 条", skipped);
            }
            Err(RecvError::Closed) => return,
        }
    }
}
