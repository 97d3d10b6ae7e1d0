//! Agent 服务器
//!
//! Unix Socket 服务，处理客户端连接和请求

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use super::broadcaster::Broadcaster;
use super::handler::Handler;
use crate::protocol::{Request, Response};
use crate::{DbConfig, OrchDb};

/// Agent 配置
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// 数据目录（默认 ~/.orchd）
    pub data_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".orchd");

        Self { data_dir }
    }
}

impl AgentConfig {
    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("agent.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("agent.pid")
    }

    /// 数据库路径
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("orchd.db")
    }

    /// 发布配置文档路径（orchd-sync 的发布目标）
    pub fn config_document_path(&self) -> PathBuf {
        self.data_dir.join("agents.json")
    }

    /// 消费进程（编排器）的 pid 文件路径，reload 信号用
    pub fn consumer_pid_path(&self) -> PathBuf {
        self.data_dir.join("orchestrator.pid")
    }
}

/// Agent 服务
pub struct Agent {
    config: AgentConfig,
    db: Arc<OrchDb>,
    broadcaster: Arc<Broadcaster>,
    handler: Arc<Handler>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl Agent {
    /// 创建 Agent
    pub fn new(config: AgentConfig) -> Result<Self> {
        // 确保数据目录存在
        fs::create_dir_all(&config.data_dir).context("创建数据目录失败")?;

        // 连接数据库
        let db_config = DbConfig::local(config.db_path());
        let db = Arc::new(OrchDb::connect(db_config)?);

        // 创建广播器和处理器
        let broadcaster = Broadcaster::new();
        let handler = Arc::new(Handler::new(db.clone(), broadcaster.clone()));

        Ok(Self {
            config,
            db,
            broadcaster,
            handler,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    /// 共享的数据库句柄（同进程内嵌场景用）
    pub fn db(&self) -> Arc<OrchDb> {
        self.db.clone()
    }

    /// 请求退出: 停止接受新连接，关闭现有连接
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // notify_one 会存一张许可: 即使 run 循环此刻不在等待也不会丢
        self.shutdown_notify.notify_one();
    }

    /// 运行 Agent
    pub async fn run(self: Arc<Self>) -> Result<()> {
        // 写入 PID 文件
        self.write_pid_file()?;

        // 清理旧的 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        // 创建 Unix Socket 监听器
        let listener = UnixListener::bind(&socket_path).context("绑定 socket 失败")?;

        // 设置 socket 权限为 0600
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;

        tracing::info!("🚀 Agent 启动: {:?}", socket_path);

        // 连接任务统一挂在 JoinSet 上: 退出时一并取消，
        // 订阅方看到连接关闭后走自己的重连补偿路径
        let mut connections = JoinSet::new();

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let agent = self.clone();
                            connections.spawn(async move {
                                if let Err(e) = agent.handle_connection(stream).await {
                                    tracing::error!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                // 回收已结束的连接任务
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = self.shutdown_notify.notified() => {
                    tracing::info!("收到退出请求，准备退出...");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("收到中断信号，准备退出...");
                    break;
                }
            }
        }

        // 丢掉所有发送通道再取消任务: 写任务结束会关闭连接，
        // 订阅方立刻看到 EOF 而不是等保活超时
        self.broadcaster.clear();
        connections.abort_all();
        while connections.join_next().await.is_some() {}

        self.cleanup();
        Ok(())
    }

    /// 处理单个连接
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        // 创建消息发送通道
        let (tx, mut rx) = mpsc::channel::<String>(100);

        // 注册连接
        let conn_id = self.broadcaster.register(tx);
        tracing::debug!("📥 新连接: conn_id={}", conn_id);

        // 启动发送任务
        let write_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // 读取请求
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    // 连接关闭
                    break;
                }
                Ok(_) => {
                    // 解析请求
                    let request: Request = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("解析请求失败: {}", e);
                            let response = Response::Error {
                                code: 400,
                                message: format!("Invalid JSON: {}", e),
                            };
                            let resp_json = serde_json::to_string(&response)?;
                            self.broadcaster
                                .try_send_to(conn_id, format!("{}\n", resp_json));
                            continue;
                        }
                    };

                    // 处理请求
                    let response = self.handler.handle(conn_id, request).await;
                    let resp_json = serde_json::to_string(&response)?;

                    // 发送响应
                    if !self
                        .broadcaster
                        .send_to(conn_id, format!("{}\n", resp_json))
                        .await
                    {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("读取失败: {}", e);
                    break;
                }
            }
        }

        // 清理
        self.broadcaster.unregister(conn_id);
        write_handle.abort();
        tracing::debug!("📤 连接关闭: conn_id={}", conn_id);

        Ok(())
    }

    /// 写入 PID 文件
    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let pid_path = self.config.pid_path();
        fs::write(&pid_path, pid.to_string())?;
        fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600))?;
        tracing::debug!("📝 写入 PID 文件: {} (pid={})", pid_path.display(), pid);
        Ok(())
    }

    /// 清理资源
    fn cleanup(&self) {
        // 删除 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        // 删除 PID 文件
        let pid_path = self.config.pid_path();
        if pid_path.exists() {
            let _ = fs::remove_file(&pid_path);
        }

        tracing::info!("🧹 Agent 清理完成");
    }
}

/// 检查 Agent 是否正在运行
pub fn is_agent_running(config: &AgentConfig) -> bool {
    let pid_path = config.pid_path();
    if !pid_path.exists() {
        return false;
    }

    // 读取 PID
    let pid_str = match fs::read_to_string(&pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    // 检查进程是否存在
    unsafe { libc::kill(pid, 0) == 0 }
}

/// 清理残留的 Agent 状态
pub fn cleanup_stale_agent(config: &AgentConfig) -> Result<()> {
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
        tracing::debug!("🧹 删除残留 socket: {:?}", socket_path);
    }

    if pid_path.exists() {
        fs::remove_file(&pid_path)?;
        tracing::debug!("🧹 删除残留 PID 文件: {:?}", pid_path);
    }

    Ok(())
}
