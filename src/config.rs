/*!
 * 同步层配置管理模块
 *
 * 管理同步层的配置，包括：
 * - 消息接口与 Hub 地址
 * - 分页上限（与服务器限制一致）
 * - 按日分组使用的时区偏移和标签格式
 * - 请求/调用超时、心跳间隔、重连退避序列
 * - Hub 方法名与事件名
 *
 * 配置文件为 JSON，缺失或解析失败时回退到默认配置。
 */

use chrono::{FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{Result, SyncError};
use crate::model::{DEFAULT_DAY_LABEL_FORMAT, format_day_label};

/// hubUrl 为空时拼接在服务器地址后的 Hub 路径
pub const DEFAULT_HUB_PATH: &str = "/hubs/chat";

// ============================================================================
// 配置结构
// ============================================================================

/// Hub 方法名与事件名
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HubNames {
    /// 加入会话房间的方法
    pub join_method: String,
    /// 离开会话房间的方法
    pub leave_method: String,
    /// 新消息事件
    pub message_created: String,
    /// 消息编辑事件
    pub message_updated: String,
    /// 消息删除事件
    pub message_deleted: String,
    /// 表情回应添加事件
    pub reaction_added: String,
    /// 表情回应移除事件
    pub reaction_removed: String,
}

impl Default for HubNames {
    fn default() -> Self {
        Self {
            join_method: "JoinConversation".to_string(),
            leave_method: "LeaveConversation".to_string(),
            message_created: "ReceiveMessage".to_string(),
            message_updated: "MessageUpdated".to_string(),
            message_deleted: "MessageDeleted".to_string(),
            reaction_added: "ReactionAdded".to_string(),
            reaction_removed: "ReactionRemoved".to_string(),
        }
    }
}

/// 同步层配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// 消息 REST 接口根地址（为空时使用会话的服务器地址）
    pub api_base_url: String,
    /// Hub WebSocket 地址（为空时由服务器地址推导）
    pub hub_url: String,
    /// 单页最大条数（服务器限制）
    pub max_page_size: u32,
    /// 默认单页条数
    pub default_page_size: u32,
    /// 按日分组使用的 UTC 偏移（分钟）
    pub day_offset_minutes: i32,
    /// 日期分隔标签格式（chrono strftime）
    pub day_label_format: String,
    /// HTTP 请求超时（秒）
    pub request_timeout_secs: u64,
    /// Hub 调用超时（秒）
    pub invoke_timeout_secs: u64,
    /// Hub 心跳间隔（秒）
    pub keep_alive_interval_secs: u64,
    /// 断线重连退避序列（毫秒），用尽后连接关闭
    pub reconnect_delays_ms: Vec<u64>,
    /// 观察者事件缓冲区大小
    pub event_buffer_size: usize,
    /// Hub 方法名与事件名
    pub hub: HubNames,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            hub_url: String::new(),
            max_page_size: 50,
            default_page_size: 30,
            day_offset_minutes: 0,
            day_label_format: DEFAULT_DAY_LABEL_FORMAT.to_string(),
            request_timeout_secs: 30,
            invoke_timeout_secs: 15,
            keep_alive_interval_secs: 15,
            reconnect_delays_ms: vec![0, 2000, 10_000, 30_000],
            event_buffer_size: 256,
            hub: HubNames::default(),
        }
    }
}

impl SyncConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("apiBaseUrl", &self.api_base_url), ("hubUrl", &self.hub_url)] {
            if !value.trim().is_empty() && Url::parse(value.trim()).is_err() {
                return Err(SyncError::Config(format!("{} 无效: {}", name, value)));
            }
        }
        if self.max_page_size == 0 {
            return Err(SyncError::Config("maxPageSize 必须大于 0".to_string()));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(SyncError::Config(format!(
                "defaultPageSize 必须在 1..={} 之间",
                self.max_page_size
            )));
        }
        if self.day_offset().is_none() {
            return Err(SyncError::Config(format!(
                "dayOffsetMinutes 超出范围: {}",
                self.day_offset_minutes
            )));
        }
        let sample = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap_or_default();
        if format_day_label(sample, &self.day_label_format).is_none() {
            return Err(SyncError::Config(format!(
                "dayLabelFormat 无法渲染日期: {}",
                self.day_label_format
            )));
        }
        for (name, secs) in [
            ("requestTimeoutSecs", self.request_timeout_secs),
            ("invokeTimeoutSecs", self.invoke_timeout_secs),
            ("keepAliveIntervalSecs", self.keep_alive_interval_secs),
        ] {
            if secs == 0 {
                return Err(SyncError::Config(format!("{} 必须大于 0", name)));
            }
        }
        Ok(())
    }

    /// 消息接口根地址：优先使用 apiBaseUrl，否则使用会话的服务器地址
    pub fn resolve_api_base_url(&self, server_url: &str) -> Result<Url> {
        let raw = match self.api_base_url.trim() {
            "" => server_url.trim(),
            configured => configured,
        };
        if raw.is_empty() {
            return Err(SyncError::Config(
                "未配置 apiBaseUrl，会话也没有服务器地址".to_string(),
            ));
        }
        Ok(Url::parse(raw)?)
    }

    /// Hub 地址：优先使用 hubUrl，否则把服务器地址换成 ws/wss 并追加默认路径
    pub fn resolve_hub_url(&self, server_url: &str) -> Result<String> {
        let configured = self.hub_url.trim();
        if !configured.is_empty() {
            return Ok(configured.to_string());
        }

        let mut url = Url::parse(server_url.trim())?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(SyncError::Config(format!("不支持的服务器协议: {}", other)));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::Config(format!("无法转换为 {} 地址", scheme)))?;
        let path = format!("{}{}", url.path().trim_end_matches('/'), DEFAULT_HUB_PATH);
        url.set_path(&path);
        Ok(url.to_string())
    }

    /// 按日分组使用的时区
    pub fn day_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.day_offset_minutes.checked_mul(60)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.reconnect_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

// ============================================================================
// 配置管理器
// ============================================================================

/// 配置管理器
pub struct ConfigManager {
    config: SyncConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    /// 从指定路径创建配置管理器
    pub fn new(config_path: PathBuf) -> Self {
        let config = Self::load_or_default(&config_path);
        Self {
            config,
            config_path,
        }
    }

    /// 加载配置或使用默认值
    pub fn load_or_default(path: &Path) -> SyncConfig {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<SyncConfig>(&content) {
                    Ok(config) => match config.validate() {
                        Ok(()) => {
                            tracing::info!("[Config] 配置已加载: {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            tracing::warn!("[Config] 配置校验失败，使用默认配置: {}", e);
                        }
                    },
                    Err(e) => {
                        tracing::warn!("[Config] 配置解析失败，使用默认配置: {}", e);
                    }
                },
                Err(e) => {
                    tracing::warn!("[Config] 配置读取失败，使用默认配置: {}", e);
                }
            }
        }

        tracing::info!("[Config] 使用默认配置");
        SyncConfig::default()
    }

    /// 保存配置
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&self.config)?;
        fs::write(&self.config_path, content)?;

        tracing::info!("[Config] 配置已保存: {:?}", self.config_path);
        Ok(())
    }

    /// 获取配置
    pub fn get_config(&self) -> &SyncConfig {
        &self.config
    }

    /// 替换配置（校验通过后写盘）
    pub fn set_config(&mut self, config: SyncConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.save()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

/// 默认配置文件路径
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("HuanvaeChat")
        .join("sync.json")
}
