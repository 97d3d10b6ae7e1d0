//! orchd-sync - 配置同步守护进程
//!
//! 对运行中的 orchd-agent 运行配置 Reconciler:
//! 订阅变更事件 → 重建快照 → 原子发布 → SIGHUP 通知编排器。

use std::sync::Arc;

use anyhow::Result;
use orchd_db::{
    AgentConfig, ClientConfig, DbConfig, OrchDb, Reconciler, ReloadSignal, SyncConfig,
};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("orchd_db=debug".parse()?))
        .init();

    tracing::info!("🚀 orchd-sync v{}", env!("CARGO_PKG_VERSION"));

    let agent_config = AgentConfig::default();

    // 重建查询用的读句柄，与订阅连接分离
    let db = Arc::new(OrchDb::connect(DbConfig::local(agent_config.db_path()))?);

    let mut client_config = ClientConfig::new("reconciler");
    client_config.data_dir = agent_config.data_dir.clone();

    let target_path = std::env::var("ORCHD_CONFIG_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| agent_config.config_document_path());
    let reload = ReloadSignal::PidFile(agent_config.consumer_pid_path());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(
        db,
        client_config,
        SyncConfig::default(),
        target_path,
        reload,
        shutdown_rx,
    );

    let handle = tokio::spawn(reconciler.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("收到中断信号，准备退出...");
    let _ = shutdown_tx.send(true);
    let _ = handle.await;

    tracing::info!("👋 orchd-sync exiting");
    Ok(())
}
