/*!
 * Hub 连接
 *
 * 基于 tokio-tungstenite 的持久连接，实现：
 * - 握手：连接后发送协议声明，等待服务器确认
 * - 调用：递增的 invocationId 对应一个 oneshot，收到 Completion 时完成
 * - 推送：服务器的 Invocation 分发给注册的事件处理器
 * - 心跳：按间隔发送 Ping；超过两倍间隔未收到任何消息视为断线
 * - 自动重连：按退避序列重试，用尽后进入 Closed
 *
 * 断线时所有未完成的调用立即失败（NotConnected），由调用方决定是否重试。
 * 认证令牌在构建时以 access_token 查询参数附加，连接本身不解析令牌。
 */

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::protocol::{self, HubMessage};
use super::{ConnectionState, EventHandler, HandlerId, HandlerTable, RealtimeChannel};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::session::{SessionContext, hub_url_with_token};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 连接状态广播缓冲区
const STATE_CHANNEL_CAPACITY: usize = 32;

// ============================================================================
// 构建器
// ============================================================================

/// Hub 连接构建器
pub struct HubConnectionBuilder {
    url: String,
    access_token: Option<String>,
    reconnect_delays: Vec<Duration>,
    invoke_timeout: Duration,
    keep_alive_interval: Duration,
}

impl HubConnectionBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        let defaults = SyncConfig::default();
        Self {
            url: url.into(),
            access_token: None,
            reconnect_delays: defaults.reconnect_delays(),
            invoke_timeout: defaults.invoke_timeout(),
            keep_alive_interval: defaults.keep_alive_interval(),
        }
    }

    /// 按配置和会话上下文构建；hubUrl 为空时由会话的服务器地址推导
    pub fn from_config(config: &SyncConfig, session: &SessionContext) -> Result<Self> {
        let url = config.resolve_hub_url(&session.server_url)?;
        Ok(Self::new(url)
            .with_access_token(session.access_token())
            .with_automatic_reconnect(config.reconnect_delays())
            .with_invoke_timeout(config.invoke_timeout())
            .with_keep_alive_interval(config.keep_alive_interval()))
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// 断线重连退避序列；空序列表示不重连
    pub fn with_automatic_reconnect(mut self, delays: Vec<Duration>) -> Self {
        self.reconnect_delays = delays;
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn build(self) -> Result<HubConnection> {
        if self.keep_alive_interval.is_zero() {
            return Err(SyncError::Config("心跳间隔必须大于 0".to_string()));
        }
        if self.invoke_timeout.is_zero() {
            return Err(SyncError::Config("调用超时必须大于 0".to_string()));
        }
        let url = match &self.access_token {
            Some(token) => hub_url_with_token(&self.url, token)?,
            None => hub_url_with_token(&self.url, "")?,
        };
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);

        Ok(HubConnection {
            inner: Arc::new(HubInner {
                url,
                reconnect_delays: self.reconnect_delays,
                invoke_timeout: self.invoke_timeout,
                keep_alive_interval: self.keep_alive_interval,
                handlers: HandlerTable::new(),
                state: RwLock::new(ConnectionState::Disconnected),
                state_tx,
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_invocation: AtomicU64::new(0),
                shutdown: Mutex::new(CancellationToken::new()),
            }),
        })
    }
}

// ============================================================================
// 连接
// ============================================================================

/// Hub 连接（可廉价克隆，共享同一条连接）
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<HubInner>,
}

struct HubInner {
    url: String,
    reconnect_delays: Vec<Duration>,
    invoke_timeout: Duration,
    keep_alive_interval: Duration,
    handlers: HandlerTable,
    state: RwLock<ConnectionState>,
    state_tx: broadcast::Sender<ConnectionState>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>,
    next_invocation: AtomicU64,
    shutdown: Mutex<CancellationToken>,
}

/// 读循环结束原因
enum LoopExit {
    /// 主动停止
    Stopped,
    /// 连接断开，是否允许重连
    Lost { allow_reconnect: bool },
}

impl HubConnection {
    /// 建立连接并启动后台读循环
    pub async fn start(&self) -> Result<()> {
        let current = self.inner.current_state();
        if matches!(
            current,
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            tracing::debug!("[Hub] 连接已在运行: {:?}", current);
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        *self.inner.shutdown.lock() = shutdown.clone();
        self.inner.transition(ConnectionState::Connecting);

        match connect_once(&self.inner.url, self.inner.invoke_timeout).await {
            Ok((sink, stream, leftover)) => {
                *self.inner.writer.lock().await = Some(sink);
                self.inner.transition(ConnectionState::Connected);
                tracing::info!("[Hub] 已连接");

                let inner = self.inner.clone();
                tokio::spawn(async move {
                    connection_loop(inner, stream, leftover, shutdown).await;
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!("[Hub] 连接失败: {}", e);
                self.inner.transition(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// 停止连接，取消重连
    pub async fn stop(&self) {
        self.inner.shutdown.lock().cancel();

        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
        }
        self.inner.fail_pending();
        self.inner.transition(ConnectionState::Disconnected);
        tracing::info!("[Hub] 连接已停止");
    }
}

#[async_trait]
impl RealtimeChannel for HubConnection {
    fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.inner.handlers.add(event, handler)
    }

    fn off(&self, event: &str, id: HandlerId) {
        self.inner.handlers.remove(event, id);
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let invocation_id = self
            .inner
            .next_invocation
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(invocation_id.clone(), tx);

        let frame = protocol::encode(&HubMessage::Invocation {
            invocation_id: Some(invocation_id.clone()),
            target: method.to_string(),
            arguments: args,
        });

        if let Err(e) = self.inner.send_text(frame).await {
            self.inner.pending.lock().remove(&invocation_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.invoke_timeout, rx).await {
            Ok(Ok(result)) => result,
            // 发送端被丢弃：连接在等待期间断开
            Ok(Err(_)) => Err(SyncError::NotConnected),
            Err(_) => {
                self.inner.pending.lock().remove(&invocation_id);
                Err(SyncError::InvokeTimeout(method.to_string()))
            }
        }
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    fn state(&self) -> ConnectionState {
        self.inner.current_state()
    }
}

impl HubInner {
    fn current_state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn transition(&self, next: ConnectionState) {
        let stored = match next {
            ConnectionState::Reconnected => ConnectionState::Connected,
            other => other,
        };
        *self.state.write() = stored;
        // 没有订阅者时发送失败，忽略
        let _ = self.state_tx.send(next);
    }

    async fn send_text(&self, frame: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(SyncError::NotConnected)?;
        sink.send(WsMessage::Text(frame.into())).await?;
        Ok(())
    }

    /// 让所有未完成的调用以 NotConnected 失败
    fn fail_pending(&self) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            tracing::debug!("[Hub] {} 个未完成调用因断线失败", pending.len());
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(SyncError::NotConnected));
        }
    }

    /// 处理一条记录；返回 Some 表示服务器要求关闭
    fn handle_record(&self, record: &str) -> Option<LoopExit> {
        let message = match protocol::decode(record) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("[Hub] 丢弃无法解析的消息: {}", e);
                return None;
            }
        };

        match message {
            HubMessage::Invocation {
                target, arguments, ..
            } => {
                let handled = self.handlers.dispatch(&target, &arguments);
                if handled == 0 {
                    tracing::trace!("[Hub] 事件无处理器: {}", target);
                }
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let sender = self.pending.lock().remove(&invocation_id);
                match sender {
                    Some(tx) => {
                        let outcome = match error {
                            Some(error) => Err(SyncError::InvokeFailed(error)),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => tracing::debug!("[Hub] 收到未知调用的完成消息: {}", invocation_id),
                }
            }
            HubMessage::Ping => {}
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                tracing::warn!(
                    "[Hub] 服务器关闭连接: {} (允许重连: {})",
                    error.as_deref().unwrap_or("无原因"),
                    allow_reconnect
                );
                return Some(LoopExit::Lost { allow_reconnect });
            }
            HubMessage::Other(kind) => {
                tracing::trace!("[Hub] 忽略消息类型: {}", kind);
            }
        }
        None
    }
}

// ============================================================================
// 后台任务
// ============================================================================

/// 连接、发送握手并等待握手响应
///
/// 返回握手响应之后同一帧中剩余的记录
async fn connect_once(url: &str, handshake_timeout: Duration) -> Result<(WsSink, WsStream, Vec<String>)> {
    let (ws_stream, _) = connect_async(url).await?;
    let (mut sink, mut stream) = ws_stream.split();

    sink.send(WsMessage::Text(protocol::encode_handshake().into()))
        .await?;

    let frame = tokio::time::timeout(handshake_timeout, read_handshake_frame(&mut stream))
        .await
        .map_err(|_| SyncError::HandshakeFailed("握手超时".to_string()))??;

    let mut records = protocol::split_records(&frame);
    let first = records
        .next()
        .ok_or_else(|| SyncError::HandshakeFailed("握手响应为空".to_string()))?;
    protocol::parse_handshake_response(first)?;
    let leftover = records.map(|r| r.to_string()).collect();

    Ok((sink, stream, leftover))
}

async fn read_handshake_frame(stream: &mut WsStream) -> Result<String> {
    while let Some(message) = stream.next().await {
        match message? {
            WsMessage::Text(text) => return Ok(text.as_str().to_string()),
            WsMessage::Close(_) => {
                return Err(SyncError::HandshakeFailed("握手期间连接被关闭".to_string()));
            }
            _ => continue,
        }
    }
    Err(SyncError::HandshakeFailed("握手期间连接已断开".to_string()))
}

/// 读循环 + 断线重连
async fn connection_loop(
    inner: Arc<HubInner>,
    mut stream: WsStream,
    mut leftover: Vec<String>,
    shutdown: CancellationToken,
) {
    loop {
        let exit = read_loop(&inner, &mut stream, std::mem::take(&mut leftover), &shutdown).await;

        inner.writer.lock().await.take();
        inner.fail_pending();

        let allow_reconnect = match exit {
            LoopExit::Stopped => return,
            LoopExit::Lost { allow_reconnect } => allow_reconnect,
        };

        if !allow_reconnect || inner.reconnect_delays.is_empty() {
            inner.transition(ConnectionState::Closed);
            tracing::warn!("[Hub] 连接已关闭，不再重连");
            return;
        }

        inner.transition(ConnectionState::Reconnecting);
        match reconnect(&inner, &shutdown).await {
            Some((sink, next_stream, next_leftover)) => {
                *inner.writer.lock().await = Some(sink);
                stream = next_stream;
                leftover = next_leftover;
                inner.transition(ConnectionState::Reconnected);
                tracing::info!("[Hub] 重连成功");
            }
            None if shutdown.is_cancelled() => return,
            None => {
                inner.transition(ConnectionState::Closed);
                tracing::warn!("[Hub] 重连次数用尽，连接已关闭");
                return;
            }
        }
    }
}

async fn read_loop(
    inner: &HubInner,
    stream: &mut WsStream,
    leftover: Vec<String>,
    shutdown: &CancellationToken,
) -> LoopExit {
    for record in &leftover {
        if let Some(exit) = inner.handle_record(record) {
            return exit;
        }
    }

    let server_timeout = inner.keep_alive_interval * 2;
    let mut keep_alive = tokio::time::interval(inner.keep_alive_interval);
    keep_alive.tick().await;
    let mut last_received = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return LoopExit::Stopped,
            _ = keep_alive.tick() => {
                if last_received.elapsed() > server_timeout {
                    tracing::warn!("[Hub] 超过 {:?} 未收到服务器消息，视为断线", server_timeout);
                    return LoopExit::Lost { allow_reconnect: true };
                }
                if let Err(e) = inner.send_text(protocol::encode(&HubMessage::Ping)).await {
                    tracing::warn!("[Hub] 心跳发送失败: {}", e);
                    return LoopExit::Lost { allow_reconnect: true };
                }
            }
            message = stream.next() => {
                last_received = Instant::now();
                match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        for record in protocol::split_records(text.as_str()) {
                            if let Some(exit) = inner.handle_record(record) {
                                return exit;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::warn!("[Hub] 连接被远端关闭");
                        return LoopExit::Lost { allow_reconnect: true };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("[Hub] 读取失败: {}", e);
                        return LoopExit::Lost { allow_reconnect: true };
                    }
                }
            }
        }
    }
}

/// 按退避序列重连；被停止或用尽返回 None
async fn reconnect(
    inner: &HubInner,
    shutdown: &CancellationToken,
) -> Option<(WsSink, WsStream, Vec<String>)> {
    for (attempt, delay) in inner.reconnect_delays.iter().enumerate() {
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(*delay) => {}
        }

        tracing::info!("[Hub] 第 {} 次重连（等待 {:?}）", attempt + 1, delay);
        match connect_once(&inner.url, inner.invoke_timeout).await {
            Ok(connection) => return Some(connection),
            Err(e) => tracing::warn!("[Hub] 第 {} 次重连失败: {}", attempt + 1, e),
        }
    }
    None
}
