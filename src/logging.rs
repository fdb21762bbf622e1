//! 日志初始化
//!
//! 宿主应用启动时调用一次；`RUST_LOG` 优先于传入的默认过滤器。

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// 初始化全局 tracing 订阅者（重复调用无副作用）
pub fn init_tracing(default_filter: &str) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));

        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .is_err()
        {
            // 宿主已安装了自己的订阅者
            tracing::debug!("[Logging] 全局订阅者已存在，跳过初始化");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing("huanvae_sync=debug");
        init_tracing("huanvae_sync=trace");
        tracing::info!("[Logging] 初始化完成");
    }
}
