//! Huanvae 会话同步层
//!
//! 为一个活动会话（私聊或频道）维护单一的有序、去重、按日分组的消息序列。
//! 消息来源：
//! - REST 历史分页
//! - 共享 Hub 连接上的实时推送
//! - 经服务器确认的本地操作（发送、编辑、删除、表情回应）
//!
//! ## 功能模块
//! - model: 消息/表情回应/会话键、服务器记录校验边界、按日分组
//! - api: 远程消息接口（`MessageApi` trait 与 reqwest 实现）
//! - realtime: Hub 连接（握手、调用、心跳、自动重连）与房间引用计数
//! - sync: 会话同步器（订阅状态机、历史合并、实时事件、本地操作）
//! - config / session / logging / error: 配置文件、会话凭证、日志初始化、错误类型
//!
//! ## 典型用法
//! ```ignore
//! let session = SessionContext::new(user_id, server_url, token);
//! let config = ConfigManager::load_or_default(&default_config_path());
//!
//! let hub = HubConnectionBuilder::from_config(&config, &session)?.build()?;
//! hub.start().await?;
//! let rooms = RoomRegistry::new(Arc::new(hub.clone()), config.hub.clone());
//!
//! let api = Arc::new(HttpMessageApi::new(&config, session.clone())?);
//! let sync = ConversationSynchronizer::new(api, rooms, session, config)?;
//! sync.subscribe(&key).await?;
//! sync.load_history(&key, 1, 30).await?;
//! ```
//!
//! ## 更新日志
//! - 从桌面客户端中拆分出同步层，去除 Tauri 命令层和本地 SQLite 存储

// ============================================
// 基础模块
// ============================================
pub mod config;
pub mod error;
pub mod logging;
pub mod session;

// ============================================
// 数据与通道
// ============================================
pub mod api;
pub mod model;
pub mod realtime;

// ============================================
// 会话同步
// ============================================
pub mod sync;

pub use api::{HttpMessageApi, MessageApi};
pub use config::{ConfigManager, HubNames, SyncConfig, default_config_path};
pub use error::{Result, SyncError};
pub use model::{ConversationKey, DisplayItem, Message, MessageId, MessageView, Reaction, ReactionId};
pub use realtime::{
    ConnectionState, HubConnection, HubConnectionBuilder, RealtimeChannel, RoomRegistry,
};
pub use session::SessionContext;
pub use sync::{ConversationSynchronizer, LoadOutcome, SubscriptionState, SyncEvent};
