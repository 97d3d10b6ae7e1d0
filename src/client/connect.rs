//! Agent Client 连接逻辑
//!
//! 连接、握手、请求/响应与推送分流

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::protocol::{EventType, Push, Request, Response};
use crate::types::{AgentConfigInput, Job, JobStatus, Message, ValueType};

/// 请求响应超时: 超时视为连接已死（静默断连），由调用方断开重连
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client 配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 数据目录（默认 ~/.orchd）
    pub data_dir: PathBuf,
    /// 组件名称
    pub component: String,
    /// 组件版本
    pub version: String,
    /// 连接重试次数
    pub connect_retries: u32,
    /// 重试间隔（毫秒）
    pub retry_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".orchd");

        Self {
            data_dir,
            component: "unknown".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connect_retries: 3,
            retry_interval_ms: 500,
        }
    }
}

impl ClientConfig {
    /// 创建新的配置
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            ..Default::default()
        }
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("agent.sock")
    }
}

/// Agent Client
///
/// 读取任务按 type 标签把行分流成响应和推送两个通道，
/// 请求/响应与事件推送互不干扰。
pub struct AgentClient {
    #[allow(dead_code)]
    config: ClientConfig,
    /// 写入端
    writer: OwnedWriteHalf,
    /// 响应接收通道
    resp_rx: mpsc::Receiver<String>,
    /// 推送接收通道
    push_rx: mpsc::Receiver<String>,
}

impl AgentClient {
    /// 发送请求并等待响应
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        let request_json = serde_json::to_string(request)?;
        self.writer
            .write_all(format!("{}\n", request_json).as_bytes())
            .await?;

        // 响应超时视为连接已死
        let response_line = timeout(REQUEST_TIMEOUT, self.resp_rx.recv())
            .await
            .context("等待响应超时")?
            .ok_or_else(|| anyhow::anyhow!("Connection closed"))?;

        let response: Response = serde_json::from_str(&response_line)?;
        Ok(response)
    }

    /// 发送请求，期望 Response::Ok
    async fn request_ok(&mut self, request: &Request) -> Result<()> {
        match self.request(request).await? {
            Response::Ok => Ok(()),
            Response::Error { code, message } => {
                Err(anyhow::anyhow!("{} (code={})", message, code))
            }
            other => Err(anyhow::anyhow!("Unexpected response: {:?}", other)),
        }
    }

    /// 发送请求，期望 Response::OkId
    async fn request_id(&mut self, request: &Request) -> Result<i64> {
        match self.request(request).await? {
            Response::OkId { id } => Ok(id),
            Response::Error { code, message } => {
                Err(anyhow::anyhow!("{} (code={})", message, code))
            }
            other => Err(anyhow::anyhow!("Unexpected response: {:?}", other)),
        }
    }

    /// 订阅事件
    pub async fn subscribe(&mut self, events: Vec<EventType>) -> Result<()> {
        self.request_ok(&Request::Subscribe { events }).await
    }

    /// 心跳（保活探测）
    pub async fn heartbeat(&mut self) -> Result<()> {
        self.request_ok(&Request::Heartbeat).await
    }

    /// 追加消息，返回新消息 id
    pub async fn submit_message(
        &mut self,
        sender: &str,
        body: &str,
        recipients: Vec<String>,
        parent_id: Option<i64>,
    ) -> Result<i64> {
        self.request_id(&Request::SubmitMessage {
            sender: sender.to_string(),
            body: body.to_string(),
            recipients,
            parent_id,
        })
        .await
    }

    /// 投递状态推进
    pub async fn mark_received(&mut self, message_id: i64, recipient: &str) -> Result<()> {
        self.request_ok(&Request::MarkReceived {
            message_id,
            recipient: recipient.to_string(),
        })
        .await
    }

    pub async fn mark_routed(&mut self, message_id: i64, recipient: &str) -> Result<()> {
        self.request_ok(&Request::MarkRouted {
            message_id,
            recipient: recipient.to_string(),
        })
        .await
    }

    pub async fn mark_responded(&mut self, message_id: i64, recipient: &str) -> Result<()> {
        self.request_ok(&Request::MarkResponded {
            message_id,
            recipient: recipient.to_string(),
        })
        .await
    }

    pub async fn mark_failed(
        &mut self,
        message_id: i64,
        recipient: &str,
        error_detail: &str,
    ) -> Result<()> {
        self.request_ok(&Request::MarkFailed {
            message_id,
            recipient: recipient.to_string(),
            error_detail: error_detail.to_string(),
        })
        .await
    }

    /// 游标式拉取待处理消息
    pub async fn list_pending(&mut self, recipient: &str, since_id: i64) -> Result<Vec<Message>> {
        match self
            .request(&Request::ListPending {
                recipient: recipient.to_string(),
                since_id,
            })
            .await?
        {
            Response::Messages { messages } => Ok(messages),
            Response::Error { code, message } => {
                Err(anyhow::anyhow!("{} (code={})", message, code))
            }
            other => Err(anyhow::anyhow!("Unexpected response: {:?}", other)),
        }
    }

    /// 创建任务
    pub async fn create_job(
        &mut self,
        owner: &str,
        requester: Option<String>,
        parent_id: Option<i64>,
        priority: i64,
        notify_list: Vec<String>,
        origin_message_id: Option<i64>,
    ) -> Result<i64> {
        self.request_id(&Request::CreateJob {
            owner: owner.to_string(),
            requester,
            parent_id,
            priority,
            notify_list,
            origin_message_id,
        })
        .await
    }

    /// 推进任务状态
    pub async fn transition_job(
        &mut self,
        job_id: i64,
        status: JobStatus,
        actor: &str,
    ) -> Result<()> {
        self.request_ok(&Request::TransitionJob {
            job_id,
            status,
            actor: actor.to_string(),
        })
        .await
    }

    /// 完成任务
    pub async fn complete_job(
        &mut self,
        job_id: i64,
        actor: &str,
        deliverable_path: Option<String>,
        deliverable_summary: Option<String>,
    ) -> Result<()> {
        self.request_ok(&Request::CompleteJob {
            job_id,
            actor: actor.to_string(),
            deliverable_path,
            deliverable_summary,
        })
        .await
    }

    /// 列出待办任务
    pub async fn list_pending_jobs(&mut self, owner: &str) -> Result<Vec<Job>> {
        match self
            .request(&Request::ListPendingJobs {
                owner: owner.to_string(),
            })
            .await?
        {
            Response::Jobs { jobs } => Ok(jobs),
            Response::Error { code, message } => {
                Err(anyhow::anyhow!("{} (code={})", message, code))
            }
            other => Err(anyhow::anyhow!("Unexpected response: {:?}", other)),
        }
    }

    /// 写入 agent 配置
    pub async fn upsert_agent_config(&mut self, input: AgentConfigInput) -> Result<()> {
        self.request_ok(&Request::UpsertAgentConfig(input)).await
    }

    /// 写入系统默认值
    pub async fn set_system_default(
        &mut self,
        key: &str,
        value: &str,
        value_type: ValueType,
    ) -> Result<()> {
        self.request_ok(&Request::SetSystemDefault {
            key: key.to_string(),
            value: value.to_string(),
            value_type,
        })
        .await
    }

    /// 接收推送事件（连接关闭时返回 None）
    pub async fn recv_push(&mut self) -> Option<Push> {
        loop {
            let line = self.push_rx.recv().await?;
            match serde_json::from_str(&line) {
                Ok(push) => return Some(push),
                Err(e) => {
                    tracing::warn!("解析推送失败，跳过: {}", e);
                }
            }
        }
    }

    /// 非阻塞取一条推送（用于合并积压事件）
    pub fn try_recv_push(&mut self) -> Option<Push> {
        while let Ok(line) = self.push_rx.try_recv() {
            if let Ok(push) = serde_json::from_str(&line) {
                return Some(push);
            }
        }
        None
    }
}

/// 连接 Agent（带重试）
pub async fn connect(config: ClientConfig) -> Result<AgentClient> {
    let socket_path = config.socket_path();

    let mut last_err = None;
    for attempt in 1..=config.connect_retries {
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                tracing::debug!("连接 Agent 成功 (attempt={})", attempt);
                return finish_connect(config, stream).await;
            }
            Err(e) => {
                tracing::debug!("连接 Agent 失败 (attempt={}): {}", attempt, e);
                last_err = Some(e);
                if attempt < config.connect_retries {
                    sleep(Duration::from_millis(config.retry_interval_ms)).await;
                }
            }
        }
    }

    Err(anyhow::anyhow!(
        "连接 Agent 失败 ({:?}): {:?}",
        socket_path,
        last_err
    ))
}

/// 完成连接（握手 + 启动读取分流任务）
async fn finish_connect(config: ClientConfig, stream: UnixStream) -> Result<AgentClient> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // 发送握手
    let handshake = Request::Handshake {
        component: config.component.clone(),
        version: config.version.clone(),
    };
    let handshake_json = serde_json::to_string(&handshake)?;
    writer
        .write_all(format!("{}\n", handshake_json).as_bytes())
        .await?;

    // 读取握手响应
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: Response = serde_json::from_str(&line)?;
    match response {
        Response::HandshakeOk { agent_version } => {
            tracing::debug!("握手成功: agent_version={}", agent_version);
        }
        Response::Error { code, message } => {
            return Err(anyhow::anyhow!("握手失败: {} (code={})", message, code));
        }
        _ => {
            return Err(anyhow::anyhow!("握手响应异常"));
        }
    }

    // 响应和推送走不同通道: 按 type 标签分流
    let (resp_tx, resp_rx) = mpsc::channel(100);
    let (push_tx, push_rx) = mpsc::channel(100);

    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // 连接关闭
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let is_push = serde_json::from_str::<serde_json::Value>(trimmed)
                        .map(|v| Push::is_push_value(&v))
                        .unwrap_or(false);

                    let target = if is_push { &push_tx } else { &resp_tx };
                    if target.send(trimmed.to_string()).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    Ok(AgentClient {
        config,
        writer,
        resp_rx,
        push_rx,
    })
}
