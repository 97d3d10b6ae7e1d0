//! 数据库连接和操作
//!
//! OrchDb 是显式构造、向下传递的资源句柄（`Arc<OrchDb>`），
//! 不是模块级单例；析构即关闭连接。

use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::migrations;
use crate::schema;
use crate::types::{
    AgentConfigInput, AgentConfigRow, Delivery, DeliveryState, Job, JobStatus, Message, Stats,
    SystemDefaultRow, ValueType,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;

/// 数据库连接句柄
pub struct OrchDb {
    pub(crate) conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    config: DbConfig,
}

/// submit_message 的返回值，同时是变更通知事件的载荷
///
/// 事件携带新消息 id、收件人集合与发送方，广播由调用方（agent handler）负责。
#[derive(Debug, Clone)]
pub struct SubmittedMessage {
    pub id: i64,
    pub sender: String,
    pub recipients: Vec<String>,
}

/// mark_responded 的任务完成副作用
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub job_id: i64,
    /// 需要广播的完成通知消息（notify_list 非空才有）
    pub notify: Option<SubmittedMessage>,
}

/// 任务创建输入
#[derive(Debug, Clone, Default)]
pub struct JobInput {
    pub owner: String,
    pub requester: Option<String>,
    pub parent_id: Option<i64>,
    /// 1-10，越界收敛到边界
    pub priority: i64,
    pub notify_list: Vec<String>,
    pub origin_message_id: Option<i64>,
}

impl OrchDb {
    /// 连接数据库
    pub fn connect(config: DbConfig) -> Result<Self> {
        // 确保目录存在
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.path)?;

        // WAL + busy timeout: agent（写）与 reconciler（读）共享同一文件
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // 管理删除依赖级联
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // 先迁移（为老数据库补列），再建 schema（新数据库直接建完整表）
        migrations::run_migrations(&conn)?;
        conn.execute_batch(&schema::full_schema())?;

        tracing::info!("数据库已连接: {:?}", config.path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// 获取底层连接 (用于测试)
    #[doc(hidden)]
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    // ==================== Message 操作 ====================

    /// 追加一条消息
    ///
    /// 返回值同时是变更事件载荷。重复提交不做去重（调用方负责 at-most-once 提交）。
    pub fn submit_message(
        &self,
        sender: &str,
        body: &str,
        recipients: &[String],
        parent_id: Option<i64>,
    ) -> Result<SubmittedMessage> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let submitted = submit_message_inner(&tx, sender, body, recipients, parent_id)?;
        tx.commit()?;
        Ok(submitted)
    }

    /// 获取单条消息（含收件人集合）
    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, sender, body, parent_id, created_at FROM messages WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, sender, body, parent_id, created_at)) => {
                let recipients = load_recipients(&conn, id)?;
                Ok(Some(Message {
                    id,
                    sender,
                    body,
                    recipients,
                    parent_id,
                    created_at,
                }))
            }
            None => Ok(None),
        }
    }

    /// 游标式拉取: 返回发给 `recipient` 且 id > `since_id` 的消息，按 id 升序
    ///
    /// 游标由调用方自己持久化。收件匹配是精确的大小写敏感身份相等，
    /// 昵称/大小写归一化是外部关心的事。
    pub fn list_pending(&self, recipient: &str, since_id: i64) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT m.id, m.sender, m.body, m.parent_id, m.created_at
            FROM messages m
            JOIN message_recipients r ON r.message_id = m.id
            WHERE r.recipient = ?1 AND m.id > ?2
            ORDER BY m.id ASC
            "#,
        )?;

        let rows: Vec<(i64, String, String, Option<i64>, i64)> = stmt
            .query_map(params![recipient, since_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut messages = Vec::with_capacity(rows.len());
        for (id, sender, body, parent_id, created_at) in rows {
            let recipients = load_recipients(&conn, id)?;
            messages.push(Message {
                id,
                sender,
                body,
                recipients,
                parent_id,
                created_at,
            });
        }

        Ok(messages)
    }

    /// 管理操作: 删除消息，级联删除收件人与投递记录
    pub fn delete_message(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    // ==================== 投递操作 ====================

    /// 幂等创建投递记录（received 状态）
    ///
    /// 记录已存在（任意状态）时是 no-op。
    pub fn mark_received(&self, message_id: i64, recipient: &str) -> Result<()> {
        let conn = self.conn.lock();

        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(Error::Validation(format!("消息不存在: {}", message_id)));
        }

        conn.execute(
            r#"
            INSERT INTO deliveries (message_id, recipient, state, received_at)
            VALUES (?1, ?2, 'received', ?3)
            ON CONFLICT(message_id, recipient) DO NOTHING
            "#,
            params![message_id, recipient, current_time_ms()],
        )?;

        Ok(())
    }

    /// received -> routed
    ///
    /// 记录不存在或已越过 received 状态时返回 InvalidStateTransition；
    /// 并发竞争的失败方必须重新读取状态后再决定是否重试。
    pub fn mark_routed(&self, message_id: i64, recipient: &str) -> Result<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            r#"
            UPDATE deliveries SET state = 'routed', routed_at = ?3
            WHERE message_id = ?1 AND recipient = ?2 AND state = 'received'
            "#,
            params![message_id, recipient, current_time_ms()],
        )?;

        if n == 0 {
            return Err(transition_error(&conn, message_id, recipient, "routed"));
        }
        Ok(())
    }

    /// routed -> responded
    ///
    /// 副作用: 如果该投递源自某个任务（origin_message_id 匹配且 owner 是本收件方）
    /// 且该任务正在进行中，任务随之完成，完成通知消息在同一事务内追加。
    /// 返回任务完成副作用（如有），供调用方广播。
    pub fn mark_responded(&self, message_id: i64, recipient: &str) -> Result<Option<JobCompletion>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let n = tx.execute(
            r#"
            UPDATE deliveries SET state = 'responded', responded_at = ?3
            WHERE message_id = ?1 AND recipient = ?2 AND state = 'routed'
            "#,
            params![message_id, recipient, current_time_ms()],
        )?;

        if n == 0 {
            return Err(transition_error(&tx, message_id, recipient, "responded"));
        }

        // 任务完成钩子: 只有 in_progress 的任务会因回应而完成
        let job_id: Option<i64> = tx
            .query_row(
                r#"
                SELECT id FROM jobs
                WHERE origin_message_id = ?1 AND owner = ?2 AND status = 'in_progress'
                ORDER BY id ASC LIMIT 1
                "#,
                params![message_id, recipient],
                |row| row.get(0),
            )
            .optional()?;

        let completion = match job_id {
            Some(id) => {
                let notify = transition_job_inner(&tx, id, JobStatus::Completed, recipient)?;
                Some(JobCompletion { job_id: id, notify })
            }
            None => None,
        };

        tx.commit()?;
        Ok(completion)
    }

    /// 任意非终态 -> failed，并记录失败详情
    pub fn mark_failed(&self, message_id: i64, recipient: &str, error_detail: &str) -> Result<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            r#"
            UPDATE deliveries SET state = 'failed', failed_at = ?3, error_detail = ?4
            WHERE message_id = ?1 AND recipient = ?2 AND state IN ('received', 'routed')
            "#,
            params![message_id, recipient, current_time_ms(), error_detail],
        )?;

        if n == 0 {
            return Err(transition_error(&conn, message_id, recipient, "failed"));
        }
        Ok(())
    }

    /// 获取投递记录
    pub fn get_delivery(&self, message_id: i64, recipient: &str) -> Result<Option<Delivery>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT message_id, recipient, state, received_at, routed_at, responded_at, failed_at, error_detail
            FROM deliveries
            WHERE message_id = ?1 AND recipient = ?2
            "#,
            params![message_id, recipient],
            |row| {
                let state_str: String = row.get(2)?;
                Ok(Delivery {
                    message_id: row.get(0)?,
                    recipient: row.get(1)?,
                    state: state_str.parse().unwrap_or(DeliveryState::Received),
                    received_at: row.get(3)?,
                    routed_at: row.get(4)?,
                    responded_at: row.get(5)?,
                    failed_at: row.get(6)?,
                    error_detail: row.get(7)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    // ==================== Job 操作 ====================

    /// 创建任务
    ///
    /// parent_id / origin_message_id 必须指向存在的行，否则校验错误。
    /// 优先级越界收敛到 1-10。
    pub fn create_job(&self, input: &JobInput) -> Result<i64> {
        if input.owner.is_empty() {
            return Err(Error::Validation("owner 不能为空".into()));
        }

        let conn = self.conn.lock();

        if let Some(parent_id) = input.parent_id {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE id = ?1",
                params![parent_id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(Error::Validation(format!("父任务不存在: {}", parent_id)));
            }
        }

        if let Some(message_id) = input.origin_message_id {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE id = ?1",
                params![message_id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(Error::Validation(format!("来源消息不存在: {}", message_id)));
            }
        }

        let priority = input.priority.clamp(1, 10);
        let notify_json = serde_json::to_string(&input.notify_list)?;
        let now = current_time_ms();

        conn.execute(
            r#"
            INSERT INTO jobs (origin_message_id, owner, requester, parent_id, status, priority, notify_list, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?7)
            "#,
            params![
                input.origin_message_id,
                input.owner,
                input.requester,
                input.parent_id,
                priority,
                notify_json,
                now,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// 推进任务状态
    ///
    /// 只有 owner 能推进；非法迁移返回 InvalidStateTransition。
    /// 迁入 completed 时在同一事务内追加通知消息（notify_list 非空才发），
    /// 返回需要广播的通知消息事件。
    pub fn transition_job(
        &self,
        job_id: i64,
        new_status: JobStatus,
        actor: &str,
    ) -> Result<Option<SubmittedMessage>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let notify = transition_job_inner(&tx, job_id, new_status, actor)?;
        tx.commit()?;
        Ok(notify)
    }

    /// 完成任务并记录交付物
    ///
    /// transition 到 completed 的便捷封装；通知恰好发一次由状态机的
    /// 单向推进保证（已完成的任务无法再次完成）。
    pub fn complete_job(
        &self,
        job_id: i64,
        actor: &str,
        deliverable_path: Option<&str>,
        deliverable_summary: Option<&str>,
    ) -> Result<Option<SubmittedMessage>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        // 先落交付物再迁移状态: 通知消息的正文要带上 summary。
        // 迁移失败时整个事务回滚，交付物不会残留。
        tx.execute(
            r#"
            UPDATE jobs SET
                deliverable_path = COALESCE(?2, deliverable_path),
                deliverable_summary = COALESCE(?3, deliverable_summary)
            WHERE id = ?1
            "#,
            params![job_id, deliverable_path, deliverable_summary],
        )?;

        let notify = transition_job_inner(&tx, job_id, JobStatus::Completed, actor)?;

        tx.commit()?;
        Ok(notify)
    }

    /// 获取单个任务
    pub fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        read_job(&conn, job_id)
    }

    /// 列出 owner 的待办任务（pending / in_progress）
    ///
    /// 优先级降序，同优先级按创建时间升序（先来先做）。
    pub fn list_pending_jobs(&self, owner: &str) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id FROM jobs
            WHERE owner = ?1 AND status IN ('pending', 'in_progress')
            ORDER BY priority DESC, created_at ASC, id ASC
            "#,
        )?;

        let ids: Vec<i64> = stmt
            .query_map(params![owner], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = read_job(&conn, id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    // ==================== Agent 配置操作 ====================

    /// 创建或更新 agent 配置（名字大小写不敏感地唯一）
    pub fn upsert_agent_config(&self, input: &AgentConfigInput) -> Result<()> {
        if input.name.is_empty() {
            return Err(Error::Validation("agent 名字不能为空".into()));
        }
        if input.model.is_empty() {
            return Err(Error::Validation("model 不能为空".into()));
        }

        let conn = self.conn.lock();
        let fallback_json = match &input.fallback_models {
            Some(list) => Some(serde_json::to_string(list)?),
            None => None,
        };
        let subagents_json = match &input.allowed_subagents {
            Some(list) => Some(serde_json::to_string(list)?),
            None => None,
        };

        conn.execute(
            r#"
            INSERT INTO agent_configs (name, model, fallback_models, reasoning_effort, instance_role, allowed_subagents, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(name) DO UPDATE SET
                model = excluded.model,
                fallback_models = excluded.fallback_models,
                reasoning_effort = excluded.reasoning_effort,
                instance_role = excluded.instance_role,
                allowed_subagents = excluded.allowed_subagents,
                updated_at = excluded.updated_at
            "#,
            params![
                input.name,
                input.model,
                fallback_json,
                input.reasoning_effort,
                input.instance_role,
                subagents_json,
                current_time_ms(),
            ],
        )?;

        Ok(())
    }

    /// 获取所有 agent 配置，按名字排序
    pub fn list_agent_configs(&self) -> Result<Vec<AgentConfigRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT name, model, fallback_models, reasoning_effort, instance_role, allowed_subagents, updated_at
            FROM agent_configs
            ORDER BY name ASC
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            let fallback_json: Option<String> = row.get(2)?;
            let subagents_json: Option<String> = row.get(5)?;
            Ok(AgentConfigRow {
                name: row.get(0)?,
                model: row.get(1)?,
                fallback_models: fallback_json.and_then(|s| serde_json::from_str(&s).ok()),
                reasoning_effort: row.get(3)?,
                instance_role: row.get(4)?,
                allowed_subagents: subagents_json.and_then(|s| serde_json::from_str(&s).ok()),
                updated_at: row.get(6)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 获取单个 agent 配置（名字大小写不敏感）
    pub fn get_agent_config(&self, name: &str) -> Result<Option<AgentConfigRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT name, model, fallback_models, reasoning_effort, instance_role, allowed_subagents, updated_at
            FROM agent_configs
            WHERE name = ?1
            "#,
            params![name],
            |row| {
                let fallback_json: Option<String> = row.get(2)?;
                let subagents_json: Option<String> = row.get(5)?;
                Ok(AgentConfigRow {
                    name: row.get(0)?,
                    model: row.get(1)?,
                    fallback_models: fallback_json.and_then(|s| serde_json::from_str(&s).ok()),
                    reasoning_effort: row.get(3)?,
                    instance_role: row.get(4)?,
                    allowed_subagents: subagents_json.and_then(|s| serde_json::from_str(&s).ok()),
                    updated_at: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    // ==================== 系统默认值操作 ====================

    /// 设置系统默认值
    pub fn set_system_default(&self, key: &str, value: &str, value_type: ValueType) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Validation("key 不能为空".into()));
        }

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO system_defaults (key, value, value_type, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                value_type = excluded.value_type,
                updated_at = excluded.updated_at
            "#,
            params![key, value, value_type.as_str(), current_time_ms()],
        )?;

        Ok(())
    }

    /// 获取所有系统默认值，按 key 排序
    pub fn list_system_defaults(&self) -> Result<Vec<SystemDefaultRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value, value_type, updated_at FROM system_defaults ORDER BY key ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            let type_str: String = row.get(2)?;
            Ok(SystemDefaultRow {
                key: row.get(0)?,
                value: row.get(1)?,
                value_type: type_str.parse().unwrap_or(ValueType::String),
                updated_at: row.get(3)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ==================== 统计 ====================

    /// 获取统计信息
    pub fn get_stats(&self) -> Result<Stats> {
        let conn = self.conn.lock();

        let message_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        let delivery_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM deliveries", [], |row| row.get(0))?;
        let job_count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        let agent_config_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM agent_configs", [], |row| row.get(0))?;

        Ok(Stats {
            message_count,
            delivery_count,
            job_count,
            agent_config_count,
        })
    }
}

// ==================== 内部实现 ====================

/// 在给定连接/事务上追加消息
fn submit_message_inner(
    conn: &Connection,
    sender: &str,
    body: &str,
    recipients: &[String],
    parent_id: Option<i64>,
) -> Result<SubmittedMessage> {
    if sender.is_empty() {
        return Err(Error::Validation("sender 不能为空".into()));
    }
    if body.is_empty() {
        return Err(Error::Validation("消息正文不能为空".into()));
    }
    if recipients.is_empty() {
        return Err(Error::Validation("收件人不能为空".into()));
    }

    if let Some(parent_id) = parent_id {
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE id = ?1",
            params![parent_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(Error::Validation(format!("父消息不存在: {}", parent_id)));
        }
    }

    conn.execute(
        "INSERT INTO messages (sender, body, parent_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![sender, body, parent_id, current_time_ms()],
    )?;
    let id = conn.last_insert_rowid();

    for recipient in recipients {
        conn.execute(
            "INSERT INTO message_recipients (message_id, recipient) VALUES (?1, ?2)",
            params![id, recipient],
        )?;
    }

    Ok(SubmittedMessage {
        id,
        sender: sender.to_string(),
        recipients: recipients.to_vec(),
    })
}

/// 加载消息的收件人集合
fn load_recipients(conn: &Connection, message_id: i64) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT recipient FROM message_recipients WHERE message_id = ?1")?;
    let rows = stmt.query_map(params![message_id], |row| row.get(0))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

/// 读取投递记录当前状态，生成迁移错误
fn transition_error(conn: &Connection, message_id: i64, recipient: &str, to: &str) -> Error {
    let current: Option<String> = conn
        .query_row(
            "SELECT state FROM deliveries WHERE message_id = ?1 AND recipient = ?2",
            params![message_id, recipient],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten();

    Error::bad_transition("delivery", current.unwrap_or_else(|| "absent".into()), to)
}

/// 读取完整任务行
fn read_job(conn: &Connection, job_id: i64) -> Result<Option<Job>> {
    conn.query_row(
        r#"
        SELECT id, origin_message_id, owner, requester, parent_id, status, priority,
               notify_list, deliverable_path, deliverable_summary, error_detail,
               created_at, started_at, completed_at, updated_at
        FROM jobs
        WHERE id = ?1
        "#,
        params![job_id],
        |row| {
            let status_str: String = row.get(5)?;
            let notify_json: String = row.get(7)?;
            Ok(Job {
                id: row.get(0)?,
                origin_message_id: row.get(1)?,
                owner: row.get(2)?,
                requester: row.get(3)?,
                parent_id: row.get(4)?,
                status: status_str.parse().unwrap_or(JobStatus::Pending),
                priority: row.get(6)?,
                notify_list: serde_json::from_str(&notify_json).unwrap_or_default(),
                deliverable_path: row.get(8)?,
                deliverable_summary: row.get(9)?,
                error_detail: row.get(10)?,
                created_at: row.get(11)?,
                started_at: row.get(12)?,
                completed_at: row.get(13)?,
                updated_at: row.get(14)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// 在给定连接/事务上推进任务状态
///
/// 迁入 completed 时追加通知消息并返回其事件载荷。
/// notify_list 恰好被消费一次: 状态机不允许二次完成。
fn transition_job_inner(
    conn: &Connection,
    job_id: i64,
    new_status: JobStatus,
    actor: &str,
) -> Result<Option<SubmittedMessage>> {
    let job = read_job(conn, job_id)?
        .ok_or_else(|| Error::Validation(format!("任务不存在: {}", job_id)))?;

    if job.owner != actor {
        return Err(Error::Authorization(format!(
            "{} 不是任务 {} 的 owner ({})",
            actor, job_id, job.owner
        )));
    }

    if !job.status.can_transition_to(new_status) {
        return Err(Error::bad_transition(
            "job",
            job.status.as_str(),
            new_status.as_str(),
        ));
    }

    let now = current_time_ms();
    let started_at = match new_status {
        JobStatus::InProgress => Some(now),
        _ => job.started_at,
    };
    let completed_at = if new_status.is_terminal() {
        Some(now)
    } else {
        None
    };

    // WHERE 带旧状态: 并发竞争时失败方改动 0 行
    let n = conn.execute(
        r#"
        UPDATE jobs SET status = ?2, started_at = ?3, completed_at = ?4, updated_at = ?5
        WHERE id = ?1 AND status = ?6
        "#,
        params![
            job_id,
            new_status.as_str(),
            started_at,
            completed_at,
            now,
            job.status.as_str(),
        ],
    )?;
    if n == 0 {
        return Err(Error::bad_transition(
            "job",
            job.status.as_str(),
            new_status.as_str(),
        ));
    }

    // 完成通知: 只在迁入 completed 的这一刻消费 notify_list
    if new_status == JobStatus::Completed && !job.notify_list.is_empty() {
        let mut body = format!("Job #{} completed by {}", job_id, job.owner);
        if let Some(summary) = &job.deliverable_summary {
            body.push_str(": ");
            body.push_str(summary);
        }
        let notify = submit_message_inner(
            conn,
            &job.owner,
            &body,
            &job.notify_list,
            job.origin_message_id,
        )?;
        return Ok(Some(notify));
    }

    Ok(None)
}

/// 获取当前时间戳 (毫秒)
pub(crate) fn current_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
