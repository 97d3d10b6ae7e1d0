//! 配置同步 Reconciler
//!
//! 长驻任务: 订阅配置变更事件 → 重建快照 → 原子发布 → 通知消费进程。
//!
//! 状态机（每个实例）:
//! - Disconnected（初始）→ 尝试连接，失败则指数退避
//! - Listening → 收到事件做一轮重建，然后回到 Listening
//! - Listening → 连接丢失 → Disconnected，安排重连
//! - 重连成功 → 必做一次无条件补偿重建（断线期间错过的事件不会重发）
//! - Shutdown（终态）→ 仅由显式退出请求进入，取消挂起的重连定时器
//!
//! 单实例同一时刻只有一轮重建在跑；重建期间到达的事件在推送通道里排队，
//! 下一轮循环合并处理 —— 只减并发不丢事件。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::backoff::Backoff;
use crate::client::{connect, AgentClient, ClientConfig};
use crate::config::SyncConfig;
use crate::db::OrchDb;
use crate::error::{Error, Result};
use crate::protocol::{EventType, Push};
use crate::publisher;
use crate::reload::ReloadSignal;
use crate::snapshot;

/// 配置同步 Reconciler
///
/// 持有两条独立的通路: 订阅连接（Unix socket）和重建查询用的
/// 数据库读句柄 —— 处于订阅模式的连接不复用作普通查询。
pub struct Reconciler {
    /// 重建查询用的读句柄
    db: Arc<OrchDb>,
    /// 订阅连接配置
    client_config: ClientConfig,
    sync: SyncConfig,
    /// 发布目标路径（约定每个目标路径只跑一个实例）
    target_path: PathBuf,
    reload: ReloadSignal,
    shutdown: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(
        db: Arc<OrchDb>,
        client_config: ClientConfig,
        sync: SyncConfig,
        target_path: PathBuf,
        reload: ReloadSignal,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            client_config,
            sync,
            target_path,
            reload,
            shutdown,
        }
    }

    /// 运行直到收到 shutdown 信号
    ///
    /// 启动时不管有没有事件都先做一轮全量重建（全新安装、
    /// 带着存量数据第一次起动的场景，永远等不到变更事件）。
    pub async fn run(mut self) {
        let mut backoff = Backoff::new(self.sync.backoff_initial, self.sync.backoff_max);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match connect(self.client_config.clone()).await {
                Ok(mut client) => {
                    backoff.reset();
                    if let Err(e) = self.serve_connection(&mut client).await {
                        tracing::warn!("订阅连接中断: {}", e);
                    }
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("连接 agent 失败: {}", e);
                }
            }

            // 退避等待；shutdown 即时取消挂起的定时器
            let delay = backoff.next_delay();
            tracing::debug!("{}ms 后重连", delay.as_millis());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        tracing::info!("🛑 reconciler 退出");
    }

    /// 单条连接的生命周期: 订阅 → 补偿重建 → 监听
    async fn serve_connection(&mut self, client: &mut AgentClient) -> anyhow::Result<()> {
        client.subscribe(vec![EventType::ConfigChanged]).await?;
        tracing::info!("📡 已订阅配置变更，开始监听");

        // 无条件补偿重建: 覆盖启动前和断线期间的一切变化
        self.rebuild_cycle().await;

        let mut keepalive = tokio::time::interval(self.sync.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await; // 首个 tick 立即返回，丢弃

        loop {
            tokio::select! {
                push = client.recv_push() => {
                    match push {
                        Some(Push::ConfigChanged { table }) => {
                            tracing::debug!("📝 配置变更: table={}", table);
                            // 合并积压的变更事件，一轮只重建一次
                            while client.try_recv_push().is_some() {}
                            self.rebuild_cycle().await;
                        }
                        Some(_) => {
                            // 与配置无关的推送，忽略
                        }
                        None => anyhow::bail!("推送通道已关闭"),
                    }
                }
                _ = keepalive.tick() => {
                    // 保活探测: 有些断连传输层不上报，只有超时才能发现
                    if let Err(e) = client.heartbeat().await {
                        anyhow::bail!("保活失败: {}", e);
                    }
                }
                _ = self.shutdown.changed() => {
                    tracing::info!("收到退出请求，停止监听");
                    return Ok(());
                }
            }
        }
    }

    /// 单轮重建: 查询 → build → publish → reload
    ///
    /// 任何失败只记日志不退出 —— 旧文档仍然有效，
    /// 下一个事件或保活触发的重连会再试。
    async fn rebuild_cycle(&self) {
        match self.rebuild_once().await {
            Ok(true) => {
                tracing::info!("✅ 配置文档已更新: {:?}", self.target_path);
                match self.reload.send() {
                    Ok(true) => tracing::debug!("已通知消费进程 reload"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("发送 reload 信号失败: {}", e),
                }
            }
            Ok(false) => {
                tracing::debug!("配置文档无变化，跳过 reload");
            }
            Err(e) => {
                tracing::error!("重建失败（保留旧文档）: {}", e);
            }
        }
    }

    /// 查询当前行状态，构建并发布文档；返回内容是否变化
    pub async fn rebuild_once(&self) -> Result<bool> {
        let db = self.db.clone();
        let (agents, defaults) = tokio::task::spawn_blocking(move || {
            let agents = db.list_agent_configs()?;
            let defaults = db.list_system_defaults()?;
            Ok::<_, Error>((agents, defaults))
        })
        .await
        .map_err(|e| Error::TransientStore(format!("查询任务失败: {}", e)))??;

        let document = snapshot::build(&agents, &defaults);
        publisher::publish(&document, &self.target_path)
    }
}
