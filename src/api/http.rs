//! 基于 reqwest 的消息接口实现
//!
//! | 操作 | 请求 |
//! |---|---|
//! | 历史消息 | `GET /api/messages/{direct|channel}/{id}?pageNumber=&pageSize=` |
//! | 发送 | `POST /api/messages` |
//! | 编辑 | `PATCH /api/messages/{id}` |
//! | 删除 | `DELETE /api/messages/{id}` |
//! | 添加回应 | `POST /api/messages/{id}/reactions` |
//! | 移除回应 | `DELETE /api/messages/{id}/reactions/{reactionId}` |
//! | 附件 | `GET /api/attachments/{ref}`，内容编码为 data URI |
//!
//! 所有请求携带 `Authorization: Bearer {token}`。

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{Value, json};
use url::Url;

use super::MessageApi;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::model::{
    ConversationKey, MessageId, NewMessage, RawMessage, RawReaction, ReactionId, decode_records,
};
use crate::session::SessionContext;

/// 无需请求即可直接展示的附件引用前缀
const DIRECT_URI_PREFIXES: [&str; 4] = ["http://", "https://", "data:", "file://"];

/// HTTP 消息接口
pub struct HttpMessageApi {
    client: Client,
    base_url: Url,
    session: SessionContext,
}

impl HttpMessageApi {
    /// apiBaseUrl 为空时使用会话的服务器地址
    pub fn new(config: &SyncConfig, session: SessionContext) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let base_url = config.resolve_api_base_url(&session.server_url)?;

        Ok(Self {
            client,
            base_url,
            session,
        })
    }

    /// 在根地址后追加路径段（自动转义）
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("apiBaseUrl 不能作为根地址: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(self.session.access_token())
    }

    /// 非 2xx 响应转换为接口错误
    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(SyncError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn fetch_page(
        &self,
        key: &ConversationKey,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RawMessage>> {
        let url = self.endpoint(&["api", "messages", key.kind(), key.id()])?;
        tracing::debug!("[Api] 获取历史消息: {} 第 {} 页", key, page);

        let response = self
            .authorized(self.client.get(url))
            .query(&[("pageNumber", page), ("pageSize", page_size)])
            .send()
            .await?;

        // 逐条解码，单条记录字段类型错误不影响整页
        let values: Vec<Value> = Self::check_status(response).await?.json().await?;
        Ok(decode_records(values))
    }

    async fn post_message(&self, message: &NewMessage) -> Result<RawMessage> {
        let url = self.endpoint(&["api", "messages"])?;
        let response = self
            .authorized(self.client.post(url))
            .json(message)
            .send()
            .await?;

        let record = Self::check_status(response).await?.json().await?;
        Ok(record)
    }

    async fn edit_message(&self, id: MessageId, content: &str) -> Result<RawMessage> {
        let url = self.endpoint(&["api", "messages", &id.to_string()])?;
        let response = self
            .authorized(self.client.patch(url))
            .json(&json!({ "content": content }))
            .send()
            .await?;

        let record = Self::check_status(response).await?.json().await?;
        Ok(record)
    }

    async fn delete_message(&self, id: MessageId) -> Result<()> {
        let url = self.endpoint(&["api", "messages", &id.to_string()])?;
        let response = self.authorized(self.client.delete(url)).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn add_reaction(&self, message_id: MessageId, emoji: &str) -> Result<RawReaction> {
        let url = self.endpoint(&["api", "messages", &message_id.to_string(), "reactions"])?;
        let response = self
            .authorized(self.client.post(url))
            .json(&json!({ "content": emoji }))
            .send()
            .await?;

        let record = Self::check_status(response).await?.json().await?;
        Ok(record)
    }

    async fn remove_reaction(&self, message_id: MessageId, reaction_id: ReactionId) -> Result<()> {
        let url = self.endpoint(&[
            "api",
            "messages",
            &message_id.to_string(),
            "reactions",
            &reaction_id.to_string(),
        ])?;
        let response = self.authorized(self.client.delete(url)).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn resolve_attachment(&self, reference: &str) -> Result<String> {
        if is_direct_uri(reference) {
            return Ok(reference.to_string());
        }

        let url = self.endpoint(&["api", "attachments", reference])?;
        let response = self.authorized(self.client.get(url)).send().await?;
        let response = Self::check_status(response).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .unwrap_or_else(|| {
                mime_guess::from_path(reference)
                    .first_or_octet_stream()
                    .to_string()
            });

        let bytes = response.bytes().await?;
        tracing::debug!("[Api] 附件已获取: {} ({} bytes)", reference, bytes.len());

        Ok(to_data_uri(&content_type, &bytes))
    }
}

/// 附件引用本身是否已是可展示的 URI
fn is_direct_uri(reference: &str) -> bool {
    DIRECT_URI_PREFIXES
        .iter()
        .any(|prefix| reference.starts_with(prefix))
}

fn to_data_uri(content_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", content_type, STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn api(base: &str) -> HttpMessageApi {
        let config = SyncConfig {
            api_base_url: base.to_string(),
            ..SyncConfig::default()
        };
        HttpMessageApi::new(&config, SessionContext::new("me", base, "token")).unwrap()
    }

    #[test]
    fn test_endpoint_building() {
        let root = api("https://api.huanvae.cn/");
        let url = root
            .endpoint(&["api", "messages", "direct", "user 1"])
            .unwrap();
        assert_eq!(url.as_str(), "https://api.huanvae.cn/api/messages/direct/user%201");

        let nested = api("https://api.huanvae.cn/chat");
        let url = nested.endpoint(&["api", "messages", "7"]).unwrap();
        assert_eq!(url.as_str(), "https://api.huanvae.cn/chat/api/messages/7");
    }

    #[test]
    fn test_base_url_falls_back_to_server_url() {
        let session = SessionContext::new("me", "https://api.huanvae.cn/", "token");
        let from_session = HttpMessageApi::new(&SyncConfig::default(), session).unwrap();
        let url = from_session.endpoint(&["api", "messages"]).unwrap();
        assert_eq!(url.as_str(), "https://api.huanvae.cn/api/messages");

        let no_server = SessionContext::new("me", "", "token");
        assert!(HttpMessageApi::new(&SyncConfig::default(), no_server).is_err());
    }

    #[test]
    fn test_data_uri() {
        assert_eq!(to_data_uri("image/png", b"abc"), "data:image/png;base64,YWJj");
        assert!(is_direct_uri("https://cdn.huanvae.cn/a.png"));
        assert!(is_direct_uri("data:image/png;base64,YWJj"));
        assert!(!is_direct_uri("f3a1b2"));
    }

    #[tokio::test]
    async fn test_direct_attachment_is_not_fetched() {
        // 根地址不可达，直接 URI 不应发起请求
        let api = api("http://127.0.0.1:9");
        let uri = api
            .resolve_attachment("https://cdn.huanvae.cn/a.png")
            .await
            .unwrap();
        assert_eq!(uri, "https://cdn.huanvae.cn/a.png");
    }

    #[test]
    fn test_invalid_base_url() {
        let config = SyncConfig {
            api_base_url: "not a url".to_string(),
            ..SyncConfig::default()
        };
        assert!(HttpMessageApi::new(&config, SessionContext::new("me", "", "t")).is_err());
    }

    // ------------------------------------------------------------------------
    // 本地 HTTP 服务器
    // ------------------------------------------------------------------------

    /// 服务器收到的请求
    #[derive(Debug)]
    struct Captured {
        request_line: String,
        headers: HashMap<String, String>,
        body: String,
    }

    /// 接受一个连接，记录请求并返回固定响应
    async fn serve_once(
        status: &'static str,
        content_type: &'static str,
        response_body: &'static [u8],
    ) -> (String, oneshot::Receiver<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let head_end = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "连接在请求头结束前关闭");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };

            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
            let mut lines = head.split("\r\n");
            let request_line = lines.next().unwrap_or_default().to_string();
            let headers: HashMap<String, String> = lines
                .filter_map(|line| line.split_once(':'))
                .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
                .collect();

            let length: usize = headers
                .get("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            while buf.len() < head_end + length {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "连接在请求体结束前关闭");
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = String::from_utf8_lossy(&buf[head_end..head_end + length]).to_string();

            let mut response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                content_type,
                response_body.len()
            )
            .into_bytes();
            response.extend_from_slice(response_body);
            socket.write_all(&response).await.unwrap();
            socket.shutdown().await.ok();

            let _ = tx.send(Captured {
                request_line,
                headers,
                body,
            });
        });

        (format!("http://{}", addr), rx)
    }

    #[tokio::test]
    async fn test_fetch_page_request_and_lenient_decode() {
        let (base, captured) = serve_once(
            "200 OK",
            "application/json",
            br#"[
                {"id": 1, "content": "hi", "senderId": "alice", "receiverId": "me",
                 "sendTimestamp": "2024-05-01T08:00:00Z"},
                {"id": 2, "content": 42, "senderId": "alice", "receiverId": "me",
                 "sendTimestamp": "2024-05-01T08:01:00Z"}
            ]"#,
        )
        .await;

        let records = api(&base)
            .fetch_page(&ConversationKey::direct("alice"), 2, 20)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content.as_deref(), Some("hi"));

        let captured = captured.await.unwrap();
        assert_eq!(
            captured.request_line,
            "GET /api/messages/direct/alice?pageNumber=2&pageSize=20 HTTP/1.1"
        );
        assert_eq!(captured.headers["authorization"], "Bearer token");
    }

    #[tokio::test]
    async fn test_post_message_sends_body() {
        let (base, captured) = serve_once(
            "200 OK",
            "application/json",
            br#"{"id": 11, "content": "hello", "senderId": "me", "channelId": "3",
                 "sendTimestamp": "2024-05-01T08:00:00Z"}"#,
        )
        .await;

        let body = NewMessage::new(&ConversationKey::channel("3"), "hello", None, vec![]);
        let record = api(&base).post_message(&body).await.unwrap();
        assert_eq!(record.into_message("me").unwrap().id, 11);

        let captured = captured.await.unwrap();
        assert_eq!(captured.request_line, "POST /api/messages HTTP/1.1");
        let sent: Value = serde_json::from_str(&captured.body).unwrap();
        assert_eq!(sent["channelId"], "3");
        assert_eq!(sent["content"], "hello");
    }

    #[tokio::test]
    async fn test_error_status_maps_to_api_error() {
        let (base, captured) = serve_once("404 Not Found", "text/plain", b"message not found").await;

        let err = api(&base).delete_message(9).await.unwrap_err();
        match err {
            SyncError::Api { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "message not found");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(captured.await.unwrap().request_line, "DELETE /api/messages/9 HTTP/1.1");
    }

    #[tokio::test]
    async fn test_remove_reaction_path() {
        let (base, captured) = serve_once("204 No Content", "text/plain", b"").await;

        api(&base).remove_reaction(5, 9).await.unwrap();
        assert_eq!(
            captured.await.unwrap().request_line,
            "DELETE /api/messages/5/reactions/9 HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn test_attachment_fetched_as_data_uri() {
        let (base, captured) = serve_once("200 OK", "image/png", b"abc").await;

        let uri = api(&base).resolve_attachment("f3a1b2").await.unwrap();
        assert_eq!(uri, "data:image/png;base64,YWJj");
        assert_eq!(captured.await.unwrap().request_line, "GET /api/attachments/f3a1b2 HTTP/1.1");
    }
}
