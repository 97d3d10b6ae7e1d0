//! orchd-db - 编排平台共享数据库与配置同步库
//!
//! 为 orchd 平台的各组件提供统一的数据访问层与配置同步核心。
//!
//! # 核心功能
//!
//! - **消息日志**: agent 间消息的追加存储，按收件人游标拉取
//! - **投递跟踪**: 每个 (message, recipient) 的单向状态机
//! - **任务树**: 委派工作的状态机，完成时消费通知列表恰好一次
//! - **配置快照**: agent 配置 + 系统默认值 → 发布文档（纯函数，字节级确定）
//! - **原子发布**: 同目录临时文件 + rename，读者永远看不到半成品
//! - **Reconciler**: 订阅变更事件，断线指数退避重连 + 无条件补偿重建
//!
//! # 架构
//!
//! 所有写入统一通过 orchd-agent 处理，其他组件使用 AgentClient 通信。
//! 成功的写入会向订阅者广播变更事件；广播是非持久的 ——
//! 断线期间错过的事件不会重发，订阅方靠重连后的补偿路径兜底
//! （reconciler 无条件重建 / 收件端按游标重新拉取）。

pub mod agent;
pub mod backoff;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod migrations;
pub mod protocol;
pub mod publisher;
pub mod reconciler;
pub mod recipient;
pub mod reload;
pub mod schema;
pub mod snapshot;
pub mod types;

// Re-exports
pub use config::{DbConfig, SyncConfig};
pub use db::{JobCompletion, JobInput, OrchDb, SubmittedMessage};
pub use error::{Error, Result};
pub use types::*;

// Protocol types
pub use protocol::{Event, EventType, Push, QueryType, Request, Response};

// 快照与发布
pub use publisher::publish;
pub use snapshot::{build, AgentEntry, ConfigDocument, DefaultKey, ModelSpec, Settings};

// 同步组件
pub use reconciler::Reconciler;
pub use recipient::RecipientListener;
pub use reload::ReloadSignal;

// Agent / Client
pub use agent::{cleanup_stale_agent, is_agent_running, Agent, AgentConfig};
pub use client::{connect, AgentClient, ClientConfig};
