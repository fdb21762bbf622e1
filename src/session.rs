//! 会话上下文
//!
//! 登录后由宿主构造并显式传入 HTTP 客户端、Hub 连接和同步器。
//! 同步层从不读取或刷新令牌本身，只把它作为不透明凭证转交。

use std::fmt;
use url::Url;

use crate::error::Result;

/// 当前登录用户上下文
#[derive(Clone)]
pub struct SessionContext {
    /// 用户 ID（用于区分自己发送的消息）
    pub user_id: String,
    /// 服务器地址
    pub server_url: String,
    /// 访问令牌（不透明）
    access_token: String,
}

impl SessionContext {
    pub fn new(
        user_id: impl Into<String>,
        server_url: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            server_url: normalize_server_url(&server_url.into()),
            access_token: access_token.into(),
        }
    }

    /// 访问令牌
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// 是否为当前用户发送
    pub fn is_self(&self, sender_id: &str) -> bool {
        self.user_id == sender_id
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("user_id", &self.user_id)
            .field("server_url", &self.server_url)
            .field("access_token", &"***")
            .finish()
    }
}

/// 清理服务器地址：去除空白和末尾斜杠
pub fn normalize_server_url(server_url: &str) -> String {
    server_url.trim().trim_end_matches('/').to_string()
}

/// 在 Hub 地址上附加 access_token 查询参数
///
/// WebSocket 握手无法携带自定义请求头，令牌只能走查询参数
pub fn hub_url_with_token(hub_url: &str, access_token: &str) -> Result<String> {
    let mut url = Url::parse(hub_url.trim())?;
    if !access_token.is_empty() {
        url.query_pairs_mut()
            .append_pair("access_token", access_token);
    }
    Ok(url.to_string())
}
