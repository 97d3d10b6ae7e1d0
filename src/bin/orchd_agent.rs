//! orchd-agent - 编排平台数据库 Agent
//!
//! 负责：
//! - 唯一写入者
//! - 接收消息/投递/任务/配置写入请求
//! - 变更事件推送

use std::sync::Arc;

use anyhow::Result;
use orchd_db::{cleanup_stale_agent, is_agent_running, Agent, AgentConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("orchd_db=debug".parse()?))
        .init();

    tracing::info!("🚀 orchd-agent v{}", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::default();

    // 检查是否已有 Agent 运行
    if is_agent_running(&config) {
        tracing::error!("❌ Agent is already running, exiting");
        std::process::exit(1);
    }

    // 清理残留状态
    if let Err(e) = cleanup_stale_agent(&config) {
        tracing::warn!("Failed to cleanup stale state: {}", e);
    }

    // 创建并运行 Agent
    let agent = Arc::new(Agent::new(config)?);
    agent.run().await?;

    tracing::info!("👋 orchd-agent exiting");
    Ok(())
}
