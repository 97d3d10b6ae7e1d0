//! 数据库与同步配置

use std::path::PathBuf;
use std::time::Duration;

/// 数据库连接配置
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite 文件路径
    pub path: PathBuf,
}

impl DbConfig {
    /// 创建本地 SQLite 配置
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// 从环境变量或默认路径创建配置
    ///
    /// 优先级: `ORCHD_DB_PATH` 环境变量 > `~/.orchd/db/orchd.db`
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var("ORCHD_DB_PATH") {
            return Self::local(path);
        }

        let default_path = dirs::home_dir()
            .map(|h| h.join(".orchd").join("db").join("orchd.db"))
            .unwrap_or_else(|| PathBuf::from("orchd.db"));

        Self::local(default_path)
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Reconciler 调优参数
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 重连退避起始间隔
    pub backoff_initial: Duration,
    /// 重连退避上限
    pub backoff_max: Duration,
    /// 保活探测周期（检测传输层没有上报的静默断连）
    pub keepalive_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_config() {
        let config = DbConfig::local("/tmp/test.db");
        assert_eq!(config.path, PathBuf::from("/tmp/test.db"));
    }

    #[test]
    fn test_sync_config_defaults() {
        let config = SyncConfig::default();
        assert!(config.backoff_initial < config.backoff_max);
        assert!(config.keepalive_interval > Duration::ZERO);
    }
}
