//! 领域类型定义

use serde::{Deserialize, Serialize};

/// 消息 —— 一条 agent 间通信
///
/// 创建后不可变；只有显式的管理操作会删除（级联删除其投递记录）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    /// 发送方身份
    pub sender: String,
    /// 消息正文
    pub body: String,
    /// 收件人集合（精确大小写匹配；允许重复，重复无意义）
    pub recipients: Vec<String>,
    /// 可选的父消息引用（回复链）
    pub parent_id: Option<i64>,
    /// 创建时间 (毫秒时间戳)
    pub created_at: i64,
}

/// 投递状态
///
/// 只允许单向推进: received -> routed -> responded，或任意非终态 -> failed。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// 收件方监听器已观察到消息
    Received,
    /// 已交给收件方的处理逻辑
    Routed,
    /// 收件方已回应 (终态)
    Responded,
    /// 处理失败 (终态)
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Received => "received",
            DeliveryState::Routed => "routed",
            DeliveryState::Responded => "responded",
            DeliveryState::Failed => "failed",
        }
    }

    /// 是否终态（终态不允许被隐式覆盖）
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Responded | DeliveryState::Failed)
    }
}

impl std::str::FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(DeliveryState::Received),
            "routed" => Ok(DeliveryState::Routed),
            "responded" => Ok(DeliveryState::Responded),
            "failed" => Ok(DeliveryState::Failed),
            other => Err(format!("unknown delivery state: {}", other)),
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 投递记录 —— 每个 (message, recipient) 对至多一条
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub message_id: i64,
    pub recipient: String,
    pub state: DeliveryState,
    /// 各状态到达时间 (毫秒时间戳)，未到达的为 None
    pub received_at: Option<i64>,
    pub routed_at: Option<i64>,
    pub responded_at: Option<i64>,
    pub failed_at: Option<i64>,
    /// 失败详情 (仅 failed 状态)
    pub error_detail: Option<String>,
}

/// 任务状态
///
/// pending -> in_progress -> {completed | failed}，或 pending -> cancelled。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// 状态机: 当前状态是否允许迁移到 `next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::InProgress)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::InProgress, JobStatus::Completed)
                | (JobStatus::InProgress, JobStatus::Failed)
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 任务 —— 委派的工作，parent_id 构成树结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// 派生自哪条消息（可选）
    pub origin_message_id: Option<i64>,
    /// 任务归属 agent（只有 owner 能推进状态）
    pub owner: String,
    /// 委派方身份（可选）
    pub requester: Option<String>,
    /// 父任务引用（树结构；取消父任务不级联子任务）
    pub parent_id: Option<i64>,
    pub status: JobStatus,
    /// 优先级 1-10，越大越优先
    pub priority: i64,
    /// 完成时要通知的 agent 身份列表
    pub notify_list: Vec<String>,
    pub deliverable_path: Option<String>,
    pub deliverable_summary: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

/// Agent 配置行 —— 单个 agent 的部署参数
///
/// 仅被快照构建器读取；消息热路径不读此表。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigRow {
    /// agent 身份（大小写不敏感地唯一）
    pub name: String,
    /// 主模型
    pub model: String,
    /// 回退模型列表（保持优先级顺序，不排序）
    pub fallback_models: Option<Vec<String>>,
    /// 推理深度偏好 —— 仅存档，发布文档不包含此字段（消费方在 spawn 时另行读取）
    pub reasoning_effort: Option<String>,
    /// 实例分类
    pub instance_role: Option<String>,
    /// 允许派生的子 agent 列表
    pub allowed_subagents: Option<Vec<String>>,
    pub updated_at: i64,
}

/// Agent 配置写入输入
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfigInput {
    pub name: String,
    pub model: String,
    pub fallback_models: Option<Vec<String>>,
    pub reasoning_effort: Option<String>,
    pub instance_role: Option<String>,
    pub allowed_subagents: Option<Vec<String>>,
}

/// 系统默认值的类型标签（用于安全解析）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Integer,
    String,
    Boolean,
    Json,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Integer => "integer",
            ValueType::String => "string",
            ValueType::Boolean => "boolean",
            ValueType::Json => "json",
        }
    }
}

impl std::str::FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integer" => Ok(ValueType::Integer),
            "string" => Ok(ValueType::String),
            "boolean" => Ok(ValueType::Boolean),
            "json" => Ok(ValueType::Json),
            other => Err(format!("unknown value type: {}", other)),
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 系统默认行 —— 对所有 agent 生效的带类型 key/value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemDefaultRow {
    pub key: String,
    pub value: String,
    pub value_type: ValueType,
    pub updated_at: i64,
}

/// 统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub message_count: i64,
    pub delivery_count: i64,
    pub job_count: i64,
    pub agent_config_count: i64,
}
