//! Agent 模块 - 唯一 Writer + 变更事件推送
//!
//! Agent 是数据库的唯一写入者，负责：
//! - 接收消息/投递/任务/配置的写入请求
//! - 每次成功写入后向订阅者广播变更事件
//! - 提供游标式拉取等查询
//!
//! 广播是非持久的: 断线订阅者错过的事件不会重发，订阅方重连后
//! 必须做一次无条件补偿（reconciler 重建 / 收件端重新拉取）。

mod broadcaster;
mod handler;
mod server;

pub use broadcaster::Broadcaster;
pub use server::{cleanup_stale_agent, is_agent_running, Agent, AgentConfig};
