//! IPC 协议定义
//!
//! 通信方式：Unix Socket + JSONL（每条消息一行 JSON + '\n'）。
//! 推送是非持久信号：断线期间错过的事件不会重发，
//! 订阅方重连后必须做一次无条件补偿（重建 / 重新拉取）。

use serde::{Deserialize, Serialize};

use crate::db::SubmittedMessage;
use crate::types::{AgentConfigInput, JobStatus, Message, Job, ValueType};

/// 请求类型（Client → Agent）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// 握手
    Handshake {
        /// 组件名称: reconciler / recipient-listener / cli
        component: String,
        /// 组件版本（用于日志和诊断）
        version: String,
    },

    /// 订阅事件
    Subscribe {
        events: Vec<EventType>,
    },

    /// 取消订阅
    Unsubscribe {
        events: Vec<EventType>,
    },

    /// 心跳（保活探测：静默断连只有靠它才能发现）
    Heartbeat,

    /// 追加消息
    SubmitMessage {
        sender: String,
        body: String,
        recipients: Vec<String>,
        parent_id: Option<i64>,
    },

    /// 投递状态推进
    MarkReceived {
        message_id: i64,
        recipient: String,
    },
    MarkRouted {
        message_id: i64,
        recipient: String,
    },
    MarkResponded {
        message_id: i64,
        recipient: String,
    },
    MarkFailed {
        message_id: i64,
        recipient: String,
        error_detail: String,
    },

    /// 游标式拉取待处理消息
    ListPending {
        recipient: String,
        since_id: i64,
    },

    /// 任务操作
    CreateJob {
        owner: String,
        requester: Option<String>,
        parent_id: Option<i64>,
        priority: i64,
        notify_list: Vec<String>,
        origin_message_id: Option<i64>,
    },
    TransitionJob {
        job_id: i64,
        status: JobStatus,
        actor: String,
    },
    CompleteJob {
        job_id: i64,
        actor: String,
        deliverable_path: Option<String>,
        deliverable_summary: Option<String>,
    },
    ListPendingJobs {
        owner: String,
    },

    /// 配置写入（触发 ConfigChanged 事件）
    UpsertAgentConfig(AgentConfigInput),
    SetSystemDefault {
        key: String,
        value: String,
        value_type: ValueType,
    },

    /// 查询
    Query {
        query_type: QueryType,
    },
}

/// 响应类型（Agent → Client）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// 成功
    Ok,

    /// 成功，带新建行的 id
    OkId {
        id: i64,
    },

    /// 错误
    Error {
        code: i32,
        message: String,
    },

    /// 握手成功
    HandshakeOk {
        agent_version: String,
    },

    /// ListPending 结果
    Messages {
        messages: Vec<Message>,
    },

    /// ListPendingJobs 结果
    Jobs {
        jobs: Vec<Job>,
    },

    /// 查询结果
    QueryResult {
        data: serde_json::Value,
    },
}

/// 推送事件（Agent → 订阅者）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Push {
    /// 新消息已追加（携带路由所需的最小信息）
    MessageSubmitted {
        message_id: i64,
        sender: String,
        recipients: Vec<String>,
    },

    /// 配置表变化（agent_configs / system_defaults）
    ConfigChanged {
        table: String,
    },

    /// 任务状态变化
    JobChanged {
        job_id: i64,
        status: JobStatus,
    },
}

impl Push {
    /// 推送消息的 type 标签集合（client 端用于区分响应与推送）
    pub const TYPE_TAGS: [&'static str; 3] = ["MessageSubmitted", "ConfigChanged", "JobChanged"];

    /// 判断一个已解析的 JSON 行是不是推送
    pub fn is_push_value(value: &serde_json::Value) -> bool {
        value
            .get("type")
            .and_then(|t| t.as_str())
            .map(|t| Self::TYPE_TAGS.contains(&t))
            .unwrap_or(false)
    }
}

/// 查询类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "query")]
pub enum QueryType {
    /// 获取 Agent 状态
    Status,
    /// 获取数据库统计
    Stats,
}

/// 事件类型（用于订阅）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    NewMessage,
    ConfigChanged,
    JobChanged,
}

/// 事件（agent 内部使用，用于广播）
#[derive(Debug, Clone)]
pub enum Event {
    MessageSubmitted(SubmittedMessage),
    ConfigChanged { table: &'static str },
    JobChanged { job_id: i64, status: JobStatus },
}

impl Event {
    /// 获取事件类型
    pub fn event_type(&self) -> EventType {
        match self {
            Event::MessageSubmitted(_) => EventType::NewMessage,
            Event::ConfigChanged { .. } => EventType::ConfigChanged,
            Event::JobChanged { .. } => EventType::JobChanged,
        }
    }

    /// 转换为 Push 消息
    pub fn to_push(&self) -> Push {
        match self {
            Event::MessageSubmitted(m) => Push::MessageSubmitted {
                message_id: m.id,
                sender: m.sender.clone(),
                recipients: m.recipients.clone(),
            },
            Event::ConfigChanged { table } => Push::ConfigChanged {
                table: table.to_string(),
            },
            Event::JobChanged { job_id, status } => Push::JobChanged {
                job_id: *job_id,
                status: *status,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = Request::SubmitMessage {
            sender: "mcp".to_string(),
            body: "hello".to_string(),
            recipients: vec!["newhart".to_string()],
            parent_id: None,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"type\":\"SubmitMessage\""));

        let parsed: Request = serde_json::from_str(&json).unwrap();
        match parsed {
            Request::SubmitMessage { sender, recipients, .. } => {
                assert_eq!(sender, "mcp");
                assert_eq!(recipients, vec!["newhart"]);
            }
            _ => panic!("Expected SubmitMessage"),
        }
    }

    #[test]
    fn test_job_status_wire_format() {
        let request = Request::TransitionJob {
            job_id: 7,
            status: JobStatus::InProgress,
            actor: "coder".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"status\":\"in_progress\""));
    }

    #[test]
    fn test_push_type_detection() {
        let push = Push::ConfigChanged {
            table: "agent_configs".to_string(),
        };
        let value = serde_json::to_value(&push).unwrap();
        assert!(Push::is_push_value(&value));

        let response = Response::Ok;
        let value = serde_json::to_value(&response).unwrap();
        assert!(!Push::is_push_value(&value));

        let response = Response::HandshakeOk {
            agent_version: "0.1.0".to_string(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert!(!Push::is_push_value(&value));
    }

    #[test]
    fn test_event_to_push() {
        let event = Event::MessageSubmitted(SubmittedMessage {
            id: 42,
            sender: "mcp".to_string(),
            recipients: vec!["newhart".to_string()],
        });
        assert_eq!(event.event_type(), EventType::NewMessage);

        match event.to_push() {
            Push::MessageSubmitted {
                message_id,
                sender,
                recipients,
            } => {
                assert_eq!(message_id, 42);
                assert_eq!(sender, "mcp");
                assert_eq!(recipients, vec!["newhart"]);
            }
            _ => panic!("Expected Push::MessageSubmitted"),
        }
    }

    #[test]
    fn test_event_type_subscribe_wire_format() {
        let request = Request::Subscribe {
            events: vec![EventType::NewMessage, EventType::ConfigChanged],
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"NewMessage\""));
        assert!(json.contains("\"ConfigChanged\""));
    }
}
