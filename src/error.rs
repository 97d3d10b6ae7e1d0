//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 输入校验错误（空消息体、空收件人、父引用不存在等）
    ///
    /// 直接返回给调用方，不应重试。
    #[error("校验错误: {0}")]
    Validation(String),

    /// 非法状态迁移（投递记录和任务的状态机只允许单向推进）
    ///
    /// 并发竞争的失败方会收到此错误；重试前必须重新读取当前状态。
    #[error("非法状态迁移: {entity} {from} -> {to}")]
    InvalidStateTransition {
        /// 实体类型: "delivery" | "job"
        entity: &'static str,
        /// 当前状态（记录不存在时为 "absent"）
        from: String,
        /// 目标状态
        to: String,
    },

    /// 权限错误 (actor 不是实体的 owner)
    #[error("权限错误: {0}")]
    Authorization(String),

    /// 存储瞬时故障（连接中断 / 超时），调用方可在退避后重试
    #[error("存储瞬时错误: {0}")]
    TransientStore(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 连接错误
    #[error("连接错误: {0}")]
    Connection(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 构造状态迁移错误的快捷方法
    pub fn bad_transition(entity: &'static str, from: impl Into<String>, to: impl Into<String>) -> Self {
        Error::InvalidStateTransition {
            entity,
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
