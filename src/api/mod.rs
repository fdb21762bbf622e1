//! 消息接口模块
//!
//! `MessageApi` 是同步器依赖的远程消息接口；`HttpMessageApi` 是基于 reqwest 的实现。
//! 接口只返回未校验的服务器记录，校验统一在同步器入口处完成。

pub mod http;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ConversationKey, MessageId, NewMessage, RawMessage, RawReaction, ReactionId};

pub use http::HttpMessageApi;

/// 远程消息接口
#[async_trait]
pub trait MessageApi: Send + Sync {
    /// 获取一页历史消息（页码从 1 开始，顺序不保证）
    async fn fetch_page(
        &self,
        key: &ConversationKey,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RawMessage>>;

    /// 发送消息，返回服务器确认的记录
    async fn post_message(&self, message: &NewMessage) -> Result<RawMessage>;

    /// 编辑消息，返回服务器确认的记录
    async fn edit_message(&self, id: MessageId, content: &str) -> Result<RawMessage>;

    async fn delete_message(&self, id: MessageId) -> Result<()>;

    /// 添加表情回应，返回服务器确认的记录
    async fn add_reaction(&self, message_id: MessageId, emoji: &str) -> Result<RawReaction>;

    async fn remove_reaction(&self, message_id: MessageId, reaction_id: ReactionId) -> Result<()>;

    /// 把附件引用解析为可展示的 URI
    async fn resolve_attachment(&self, reference: &str) -> Result<String>;
}
