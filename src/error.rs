//! 错误类型
//!
//! 同步层只向调用方暴露一类可恢复错误：网络/接口失败。
//! 过期事件、引用缺失事件、确认消息与回显重复都在内部消化，不产生错误。

use thiserror::Error;

/// 同步层错误类型
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("HTTP 请求失败: {0}")]
    Http(Box<reqwest::Error>),

    #[error("WebSocket 错误: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("接口错误 ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("实时通道未连接")]
    NotConnected,

    #[error("Hub 握手失败: {0}")]
    HandshakeFailed(String),

    #[error("Hub 调用超时: {0}")]
    InvokeTimeout(String),

    #[error("Hub 调用失败: {0}")]
    InvokeFailed(String),

    #[error("参数无效: {0}")]
    InvalidArgument(String),

    #[error("无效的消息记录: {0}")]
    InvalidRecord(String),

    #[error("配置错误: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Http(Box::new(err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::WebSocket(Box::new(err))
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::Config(format!("URL 无效: {}", err))
    }
}

impl SyncError {
    /// 是否属于可重试的网络类错误（由调用方决定是否重试）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Http(_)
                | SyncError::WebSocket(_)
                | SyncError::Io(_)
                | SyncError::NotConnected
                | SyncError::InvokeTimeout(_)
        ) || matches!(self, SyncError::Api { status, .. } if *status >= 500)
    }
}
