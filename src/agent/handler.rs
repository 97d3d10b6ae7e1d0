//! 请求处理器
//!
//! 处理来自客户端的各类请求；每次成功写入后广播对应的变更事件。

use std::sync::Arc;

use super::broadcaster::{Broadcaster, ConnId};
use crate::db::{JobInput, OrchDb};
use crate::error::Error;
use crate::protocol::{Event, QueryType, Request, Response};
use crate::types::JobStatus;

/// Agent 版本号（跟随 crate 版本）
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 请求处理器
pub struct Handler {
    /// 数据库连接
    db: Arc<OrchDb>,
    /// 广播器
    broadcaster: Arc<Broadcaster>,
}

impl Handler {
    /// 创建处理器
    pub fn new(db: Arc<OrchDb>, broadcaster: Arc<Broadcaster>) -> Self {
        Self { db, broadcaster }
    }

    /// 处理请求
    pub async fn handle(&self, conn_id: ConnId, request: Request) -> Response {
        match request {
            Request::Handshake { component, version } => {
                tracing::info!(
                    "🤝 握手: conn_id={}, component={}, version={}",
                    conn_id,
                    component,
                    version
                );
                Response::HandshakeOk {
                    agent_version: AGENT_VERSION.to_string(),
                }
            }

            Request::Subscribe { events } => {
                self.broadcaster.subscribe(conn_id, events);
                Response::Ok
            }

            Request::Unsubscribe { events } => {
                self.broadcaster.unsubscribe(conn_id, events);
                Response::Ok
            }

            Request::Heartbeat => Response::Ok,

            Request::SubmitMessage {
                sender,
                body,
                recipients,
                parent_id,
            } => self.handle_submit_message(&sender, &body, &recipients, parent_id),

            Request::MarkReceived {
                message_id,
                recipient,
            } => match self.db.mark_received(message_id, &recipient) {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            },

            Request::MarkRouted {
                message_id,
                recipient,
            } => match self.db.mark_routed(message_id, &recipient) {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            },

            Request::MarkResponded {
                message_id,
                recipient,
            } => self.handle_mark_responded(message_id, &recipient),

            Request::MarkFailed {
                message_id,
                recipient,
                error_detail,
            } => match self.db.mark_failed(message_id, &recipient, &error_detail) {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            },

            Request::ListPending {
                recipient,
                since_id,
            } => match self.db.list_pending(&recipient, since_id) {
                Ok(messages) => Response::Messages { messages },
                Err(e) => error_response(&e),
            },

            Request::CreateJob {
                owner,
                requester,
                parent_id,
                priority,
                notify_list,
                origin_message_id,
            } => {
                let input = JobInput {
                    owner,
                    requester,
                    parent_id,
                    priority,
                    notify_list,
                    origin_message_id,
                };
                match self.db.create_job(&input) {
                    Ok(id) => Response::OkId { id },
                    Err(e) => error_response(&e),
                }
            }

            Request::TransitionJob {
                job_id,
                status,
                actor,
            } => self.handle_transition_job(job_id, status, &actor),

            Request::CompleteJob {
                job_id,
                actor,
                deliverable_path,
                deliverable_summary,
            } => self.handle_complete_job(
                job_id,
                &actor,
                deliverable_path.as_deref(),
                deliverable_summary.as_deref(),
            ),

            Request::ListPendingJobs { owner } => match self.db.list_pending_jobs(&owner) {
                Ok(jobs) => Response::Jobs { jobs },
                Err(e) => error_response(&e),
            },

            Request::UpsertAgentConfig(input) => match self.db.upsert_agent_config(&input) {
                Ok(()) => {
                    self.broadcaster.broadcast(Event::ConfigChanged {
                        table: "agent_configs",
                    });
                    Response::Ok
                }
                Err(e) => error_response(&e),
            },

            Request::SetSystemDefault {
                key,
                value,
                value_type,
            } => match self.db.set_system_default(&key, &value, value_type) {
                Ok(()) => {
                    self.broadcaster.broadcast(Event::ConfigChanged {
                        table: "system_defaults",
                    });
                    Response::Ok
                }
                Err(e) => error_response(&e),
            },

            Request::Query { query_type } => self.handle_query(query_type),
        }
    }

    /// 处理消息追加: 写入成功后广播 NewMessage 事件
    fn handle_submit_message(
        &self,
        sender: &str,
        body: &str,
        recipients: &[String],
        parent_id: Option<i64>,
    ) -> Response {
        match self.db.submit_message(sender, body, recipients, parent_id) {
            Ok(submitted) => {
                let id = submitted.id;
                self.broadcaster.broadcast(Event::MessageSubmitted(submitted));
                Response::OkId { id }
            }
            Err(e) => error_response(&e),
        }
    }

    /// 处理投递回应: 可能连带完成任务并追加完成通知
    fn handle_mark_responded(&self, message_id: i64, recipient: &str) -> Response {
        match self.db.mark_responded(message_id, recipient) {
            Ok(completion) => {
                if let Some(completion) = completion {
                    self.broadcaster.broadcast(Event::JobChanged {
                        job_id: completion.job_id,
                        status: JobStatus::Completed,
                    });
                    if let Some(notify) = completion.notify {
                        self.broadcaster.broadcast(Event::MessageSubmitted(notify));
                    }
                }
                Response::Ok
            }
            Err(e) => error_response(&e),
        }
    }

    fn handle_transition_job(&self, job_id: i64, status: JobStatus, actor: &str) -> Response {
        match self.db.transition_job(job_id, status, actor) {
            Ok(notify) => {
                self.broadcaster.broadcast(Event::JobChanged { job_id, status });
                if let Some(notify) = notify {
                    self.broadcaster.broadcast(Event::MessageSubmitted(notify));
                }
                Response::Ok
            }
            Err(e) => error_response(&e),
        }
    }

    fn handle_complete_job(
        &self,
        job_id: i64,
        actor: &str,
        deliverable_path: Option<&str>,
        deliverable_summary: Option<&str>,
    ) -> Response {
        match self
            .db
            .complete_job(job_id, actor, deliverable_path, deliverable_summary)
        {
            Ok(notify) => {
                self.broadcaster.broadcast(Event::JobChanged {
                    job_id,
                    status: JobStatus::Completed,
                });
                if let Some(notify) = notify {
                    self.broadcaster.broadcast(Event::MessageSubmitted(notify));
                }
                Response::Ok
            }
            Err(e) => error_response(&e),
        }
    }

    /// 处理查询
    fn handle_query(&self, query_type: QueryType) -> Response {
        match query_type {
            QueryType::Status => {
                let status = serde_json::json!({
                    "agent_version": AGENT_VERSION,
                    "connections": self.broadcaster.connection_count(),
                });
                Response::QueryResult { data: status }
            }
            QueryType::Stats => match self.db.get_stats() {
                Ok(stats) => match serde_json::to_value(&stats) {
                    Ok(data) => Response::QueryResult { data },
                    Err(e) => Response::Error {
                        code: 500,
                        message: e.to_string(),
                    },
                },
                Err(e) => error_response(&e),
            },
        }
    }
}

/// 错误 → 线上响应的映射
fn error_response(e: &Error) -> Response {
    let code = match e {
        Error::Validation(_) => 400,
        Error::Authorization(_) => 403,
        Error::InvalidStateTransition { .. } => 409,
        Error::TransientStore(_) => 503,
        _ => 500,
    };
    Response::Error {
        code,
        message: e.to_string(),
    }
}
