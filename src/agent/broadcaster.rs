//! 事件广播器
//!
//! 维护订阅列表，将变更事件推送给订阅者

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::{Event, EventType};

/// 连接 ID
pub type ConnId = u64;

/// 消息发送通道
pub type MessageSender = mpsc::Sender<String>;

/// 事件广播器
pub struct Broadcaster {
    /// 订阅关系：ConnId → 订阅的事件类型
    subscriptions: RwLock<HashMap<ConnId, HashSet<EventType>>>,
    /// 连接通道：ConnId → 发送通道
    senders: RwLock<HashMap<ConnId, MessageSender>>,
    /// 下一个连接 ID
    next_conn_id: RwLock<ConnId>,
}

impl Broadcaster {
    /// 创建新的广播器
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(HashMap::new()),
            senders: RwLock::new(HashMap::new()),
            next_conn_id: RwLock::new(1),
        })
    }

    /// 注册新连接，返回连接 ID
    pub fn register(&self, sender: MessageSender) -> ConnId {
        let mut next_id = self.next_conn_id.write();
        let conn_id = *next_id;
        *next_id += 1;

        self.senders.write().insert(conn_id, sender);
        self.subscriptions.write().insert(conn_id, HashSet::new());

        tracing::debug!("📡 Connection registered: conn_id={}", conn_id);
        conn_id
    }

    /// 注销连接
    pub fn unregister(&self, conn_id: ConnId) {
        self.senders.write().remove(&conn_id);
        self.subscriptions.write().remove(&conn_id);
        tracing::debug!("📡 Connection unregistered: conn_id={}", conn_id);
    }

    /// 订阅事件
    pub fn subscribe(&self, conn_id: ConnId, events: Vec<EventType>) {
        if let Some(sub) = self.subscriptions.write().get_mut(&conn_id) {
            for event in &events {
                sub.insert(*event);
            }
            tracing::debug!("📡 Subscribed: conn_id={}, events={:?}", conn_id, events);
        }
    }

    /// 取消订阅
    pub fn unsubscribe(&self, conn_id: ConnId, events: Vec<EventType>) {
        if let Some(sub) = self.subscriptions.write().get_mut(&conn_id) {
            for event in &events {
                sub.remove(event);
            }
            tracing::debug!("📡 Unsubscribed: conn_id={}, events={:?}", conn_id, events);
        }
    }

    /// 广播事件给所有订阅者（非阻塞，fire-and-forget）
    ///
    /// 返回推送到的连接数。通道满时丢弃该订阅者的这条推送 ——
    /// 订阅方的补偿路径（重建 / 重新拉取）兜底。
    pub fn broadcast(&self, event: Event) -> usize {
        let event_type = event.event_type();
        let push = event.to_push();

        // 序列化消息（JSONL 格式）
        let message = match serde_json::to_string(&push) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                tracing::error!("Failed to serialize event: {}", e);
                return 0;
            }
        };

        // 获取需要推送的连接
        let targets: Vec<(ConnId, MessageSender)> = {
            let subs = self.subscriptions.read();
            let senders = self.senders.read();

            subs.iter()
                .filter(|(_, subscribed)| subscribed.contains(&event_type))
                .filter_map(|(conn_id, _)| senders.get(conn_id).map(|s| (*conn_id, s.clone())))
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!("📡 No subscribers: event_type={:?}", event_type);
            return 0;
        }

        tracing::debug!(
            "📡 Broadcasting: event_type={:?}, subscribers={}",
            event_type,
            targets.len()
        );

        let mut delivered = 0;
        for (conn_id, sender) in targets {
            let msg = message.clone();
            match sender.try_send(msg) {
                Ok(_) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("📡 Channel full, dropping push: conn_id={}", conn_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("📡 Channel closed: conn_id={}", conn_id);
                }
            }
        }
        delivered
    }

    /// 注销所有连接（agent 退出时调用）
    ///
    /// 丢掉全部发送通道，各连接的写任务随之结束、连接关闭，
    /// 订阅方立刻看到 EOF 并进入自己的重连路径。
    pub fn clear(&self) {
        self.senders.write().clear();
        self.subscriptions.write().clear();
        tracing::debug!("📡 All connections cleared");
    }

    /// 获取当前连接数
    pub fn connection_count(&self) -> usize {
        self.senders.read().len()
    }

    /// 检查是否有活跃连接
    pub fn has_connections(&self) -> bool {
        !self.senders.read().is_empty()
    }

    /// 发送消息到指定连接
    pub async fn send_to(&self, conn_id: ConnId, message: String) -> bool {
        // 先拿 sender 的 clone，再释放锁
        let sender = {
            let senders = self.senders.read();
            senders.get(&conn_id).cloned()
        };

        if let Some(sender) = sender {
            sender.send(message).await.is_ok()
        } else {
            false
        }
    }

    /// 尝试发送消息到指定连接（非阻塞）
    pub fn try_send_to(&self, conn_id: ConnId, message: String) -> bool {
        let sender = {
            let senders = self.senders.read();
            senders.get(&conn_id).cloned()
        };

        if let Some(sender) = sender {
            sender.try_send(message).is_ok()
        } else {
            false
        }
    }
}
