//! 消息模型模块
//!
//! ## 模块结构
//!
//! - `types`: 工作集类型（ConversationKey, Message, Reaction）
//! - `wire`: 服务器记录（RawMessage, RawReaction, NewMessage）与校验边界
//! - `grouping`: 展示序列（DisplayItem）与按日分组

pub mod grouping;
pub mod types;
pub mod wire;

pub use grouping::*;
pub use types::*;
pub use wire::{NewMessage, RawMessage, RawReaction, decode_records};
