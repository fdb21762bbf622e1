/*!
 * Hub 协议定义
 *
 * 协议概述（JSON 编码）：
 * 1. 连接建立后客户端发送握手 `{"protocol":"json","version":1}`
 * 2. 服务器回复 `{}`（或带 `error` 字段）
 * 3. 之后双方收发以 `type` 区分的消息
 *
 * 每条记录以 0x1E 结尾，一个 WebSocket 帧可能包含多条记录。
 */

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Result, SyncError};

/// 记录分隔符
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// 协议名
pub const PROTOCOL_NAME: &str = "json";

/// 协议版本
pub const PROTOCOL_VERSION: u32 = 1;

// 消息类型
const TYPE_INVOCATION: u64 = 1;
const TYPE_COMPLETION: u64 = 3;
const TYPE_PING: u64 = 6;
const TYPE_CLOSE: u64 = 7;

/// 握手请求
#[derive(Debug, Clone, Serialize)]
pub struct HandshakeRequest {
    pub protocol: &'static str,
    pub version: u32,
}

/// 握手响应
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

/// Hub 消息
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// 方法调用（服务器推送事件也是调用）
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    /// 调用完成
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    /// 服务器关闭连接
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// 客户端不处理的类型（流式消息等）
    Other(u64),
}

/// 编码握手请求
pub fn encode_handshake() -> String {
    let request = HandshakeRequest {
        protocol: PROTOCOL_NAME,
        version: PROTOCOL_VERSION,
    };
    // HandshakeRequest 只含字符串和整数，序列化不会失败
    let body = serde_json::to_string(&request).unwrap_or_default();
    format!("{}{}", body, RECORD_SEPARATOR)
}

/// 解析握手响应记录
pub fn parse_handshake_response(record: &str) -> Result<()> {
    let response: HandshakeResponse = serde_json::from_str(record)
        .map_err(|e| SyncError::HandshakeFailed(format!("握手响应无效: {}", e)))?;
    match response.error {
        Some(error) => Err(SyncError::HandshakeFailed(error)),
        None => Ok(()),
    }
}

/// 按记录分隔符拆分帧
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}

/// 编码一条消息（含结尾分隔符）
pub fn encode(message: &HubMessage) -> String {
    let value = match message {
        HubMessage::Invocation {
            invocation_id,
            target,
            arguments,
        } => {
            let mut map = Map::new();
            map.insert("type".into(), json!(TYPE_INVOCATION));
            if let Some(id) = invocation_id {
                map.insert("invocationId".into(), json!(id));
            }
            map.insert("target".into(), json!(target));
            map.insert("arguments".into(), Value::Array(arguments.clone()));
            Value::Object(map)
        }
        HubMessage::Completion {
            invocation_id,
            result,
            error,
        } => {
            let mut map = Map::new();
            map.insert("type".into(), json!(TYPE_COMPLETION));
            map.insert("invocationId".into(), json!(invocation_id));
            if let Some(result) = result {
                map.insert("result".into(), result.clone());
            }
            if let Some(error) = error {
                map.insert("error".into(), json!(error));
            }
            Value::Object(map)
        }
        HubMessage::Ping => json!({ "type": TYPE_PING }),
        HubMessage::Close {
            error,
            allow_reconnect,
        } => {
            let mut map = Map::new();
            map.insert("type".into(), json!(TYPE_CLOSE));
            if let Some(error) = error {
                map.insert("error".into(), json!(error));
            }
            map.insert("allowReconnect".into(), json!(allow_reconnect));
            Value::Object(map)
        }
        HubMessage::Other(kind) => json!({ "type": kind }),
    };
    format!("{}{}", value, RECORD_SEPARATOR)
}

/// 解码一条记录（不含分隔符）
pub fn decode(record: &str) -> Result<HubMessage> {
    let value: Value = serde_json::from_str(record)?;
    let kind = value
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| SyncError::InvalidRecord(format!("Hub 消息缺少 type: {}", record)))?;

    let text = |field: &str| {
        value
            .get(field)
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    };

    let message = match kind {
        TYPE_INVOCATION => HubMessage::Invocation {
            invocation_id: text("invocationId"),
            target: text("target").ok_or_else(|| {
                SyncError::InvalidRecord("Invocation 缺少 target".to_string())
            })?,
            arguments: value
                .get("arguments")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        },
        TYPE_COMPLETION => HubMessage::Completion {
            invocation_id: text("invocationId").ok_or_else(|| {
                SyncError::InvalidRecord("Completion 缺少 invocationId".to_string())
            })?,
            result: value.get("result").cloned(),
            error: text("error"),
        },
        TYPE_PING => HubMessage::Ping,
        TYPE_CLOSE => HubMessage::Close {
            error: text("error"),
            allow_reconnect: value
                .get("allowReconnect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        other => HubMessage::Other(other),
    };

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake() {
        assert_eq!(encode_handshake(), "{\"protocol\":\"json\",\"version\":1}\u{1e}");
        assert!(parse_handshake_response("{}").is_ok());
        assert!(parse_handshake_response(r#"{"error":"Requested protocol 'json' is not available."}"#).is_err());
        assert!(parse_handshake_response("garbage").is_err());
    }

    #[test]
    fn test_split_multiple_records_in_one_frame() {
        let frame = "{}\u{1e}{\"type\":6}\u{1e}";
        let records: Vec<&str> = split_records(frame).collect();
        assert_eq!(records, vec!["{}", "{\"type\":6}"]);
    }

    #[test]
    fn test_decode_server_invocation() {
        let message = decode(r#"{"type":1,"target":"ReceiveMessage","arguments":[{"id":1}]}"#).unwrap();
        assert_eq!(
            message,
            HubMessage::Invocation {
                invocation_id: None,
                target: "ReceiveMessage".to_string(),
                arguments: vec![json!({"id": 1})],
            }
        );
    }

    #[test]
    fn test_decode_completion_and_close() {
        assert_eq!(
            decode(r#"{"type":3,"invocationId":"4","error":"denied"}"#).unwrap(),
            HubMessage::Completion {
                invocation_id: "4".to_string(),
                result: None,
                error: Some("denied".to_string()),
            }
        );
        assert_eq!(
            decode(r#"{"type":7,"allowReconnect":true}"#).unwrap(),
            HubMessage::Close {
                error: None,
                allow_reconnect: true,
            }
        );
        assert_eq!(decode(r#"{"type":2}"#).unwrap(), HubMessage::Other(2));
        assert!(decode(r#"{"target":"x"}"#).is_err());
    }

    #[test]
    fn test_encode_client_invocation() {
        let frame = encode(&HubMessage::Invocation {
            invocation_id: Some("0".to_string()),
            target: "JoinConversation".to_string(),
            arguments: vec![json!({"kind": "channel", "id": "3"})],
        });
        assert!(frame.ends_with(RECORD_SEPARATOR));
        let decoded = decode(frame.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert!(matches!(
            decoded,
            HubMessage::Invocation { invocation_id: Some(ref id), .. } if id == "0"
        ));
    }
}
