//! 收件端消息监听器
//!
//! 每个收件 agent 一个实例: 订阅新消息推送，醒来后按游标拉取
//! 自己的待处理消息，逐条置为 received 并交给处理回调。
//!
//! 推送只是加速器 —— 它跨断线会丢，`list_pending` 轮询才是权威路径。
//! 连接/退避/补偿逻辑与配置 reconciler 相同: 重连成功后必做一次
//! 无条件拉取，覆盖断线期间错过的消息。

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::backoff::Backoff;
use crate::client::{connect, AgentClient, ClientConfig};
use crate::config::SyncConfig;
use crate::protocol::{EventType, Push};
use crate::types::Message;

/// 消息处理回调
pub type MessageCallback = Box<dyn FnMut(Message) + Send>;

/// 收件端监听器
pub struct RecipientListener {
    client_config: ClientConfig,
    /// 本监听器代表的收件身份（精确大小写匹配）
    recipient: String,
    /// 游标: 最后处理过的消息 id。初值由调用方提供并自行持久化。
    cursor: i64,
    sync: SyncConfig,
    shutdown: watch::Receiver<bool>,
    on_message: MessageCallback,
}

impl RecipientListener {
    pub fn new(
        client_config: ClientConfig,
        recipient: impl Into<String>,
        since_id: i64,
        sync: SyncConfig,
        shutdown: watch::Receiver<bool>,
        on_message: MessageCallback,
    ) -> Self {
        Self {
            client_config,
            recipient: recipient.into(),
            cursor: since_id,
            sync,
            shutdown,
            on_message,
        }
    }

    /// 运行直到收到 shutdown 信号
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
                        tracing::warn!("[{}] 订阅连接中断: {}", self.recipient, e);
                    }
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("[{}] 连接 agent 失败: {}", self.recipient, e);
                }
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        tracing::info!("🛑 收件监听器退出: {}", self.recipient);
    }

    async fn serve_connection(&mut self, client: &mut AgentClient) -> anyhow::Result<()> {
        client.subscribe(vec![EventType::NewMessage]).await?;

        // 补偿拉取: 覆盖断线期间到达的消息
        self.drain_pending(client).await?;

        let mut keepalive = tokio::time::interval(self.sync.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            tokio::select! {
                push = client.recv_push() => {
                    match push {
                        Some(Push::MessageSubmitted { recipients, .. }) => {
                            // 只响应发给自己的消息；拉取仍走权威的游标路径
                            if recipients.iter().any(|r| r == &self.recipient) {
                                while client.try_recv_push().is_some() {}
                                self.drain_pending(client).await?;
                            }
                        }
                        Some(_) => {}
                        None => anyhow::bail!("推送通道已关闭"),
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = client.heartbeat().await {
                        anyhow::bail!("保活失败: {}", e);
                    }
                }
                _ = self.shutdown.changed() => return Ok(()),
            }
        }
    }

    /// 拉取游标之后的所有消息，置 received 并交给回调
    async fn drain_pending(&mut self, client: &mut AgentClient) -> anyhow::Result<()> {
        let messages = client.list_pending(&self.recipient, self.cursor).await?;
        if messages.is_empty() {
            return Ok(());
        }

        tracing::debug!("[{}] 拉到 {} 条新消息", self.recipient, messages.len());

        for message in messages {
            client.mark_received(message.id, &self.recipient).await?;
            self.cursor = self.cursor.max(message.id);
            (self.on_message)(message);
        }

        Ok(())
    }
}
