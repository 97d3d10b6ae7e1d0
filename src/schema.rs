//! 数据库 Schema 定义

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- Messages 表（只追加；创建后不可变）
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender TEXT NOT NULL,
    body TEXT NOT NULL,
    parent_id INTEGER REFERENCES messages(id),
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

-- 收件人表（无唯一约束：允许重复，重复无意义；身份精确大小写匹配）
CREATE TABLE IF NOT EXISTS message_recipients (
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    recipient TEXT NOT NULL
);

-- 投递记录表（复合主键: 每个 (message, recipient) 至多一条）
CREATE TABLE IF NOT EXISTS deliveries (
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    recipient TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'received',  -- received | routed | responded | failed
    received_at INTEGER,
    routed_at INTEGER,
    responded_at INTEGER,
    failed_at INTEGER,
    error_detail TEXT,
    PRIMARY KEY (message_id, recipient)
);

-- Jobs 表（parent_id 构成树；从不自动删除）
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    origin_message_id INTEGER REFERENCES messages(id),
    owner TEXT NOT NULL,
    requester TEXT,
    parent_id INTEGER REFERENCES jobs(id),
    status TEXT NOT NULL DEFAULT 'pending',  -- pending | in_progress | completed | failed | cancelled
    priority INTEGER NOT NULL DEFAULT 5,     -- 1-10，越大越优先
    notify_list TEXT NOT NULL DEFAULT '[]',  -- JSON 数组，完成时通知的 agent 列表
    deliverable_path TEXT,
    deliverable_summary TEXT,
    error_detail TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    started_at INTEGER,
    completed_at INTEGER,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

-- Agent 配置表（每个 agent 一行；名字大小写不敏感）
CREATE TABLE IF NOT EXISTS agent_configs (
    name TEXT PRIMARY KEY COLLATE NOCASE,
    model TEXT NOT NULL,
    fallback_models TEXT,     -- JSON 数组；NULL 表示无回退
    reasoning_effort TEXT,    -- 仅存档；不进入发布文档
    instance_role TEXT,
    allowed_subagents TEXT,   -- JSON 数组
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

-- 系统默认值表（带类型标签的 key/value，对所有 agent 生效）
CREATE TABLE IF NOT EXISTS system_defaults (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    value_type TEXT NOT NULL DEFAULT 'string',  -- integer | string | boolean | json
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

-- 索引
CREATE INDEX IF NOT EXISTS idx_recipients_message ON message_recipients(message_id);
CREATE INDEX IF NOT EXISTS idx_recipients_lookup ON message_recipients(recipient, message_id);
CREATE INDEX IF NOT EXISTS idx_deliveries_recipient ON deliveries(recipient);
CREATE INDEX IF NOT EXISTS idx_deliveries_state ON deliveries(state);
CREATE INDEX IF NOT EXISTS idx_jobs_owner_status ON jobs(owner, status);
CREATE INDEX IF NOT EXISTS idx_jobs_parent ON jobs(parent_id) WHERE parent_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_jobs_origin ON jobs(origin_message_id) WHERE origin_message_id IS NOT NULL;
"#;

/// 获取完整 Schema
pub fn full_schema() -> String {
    SCHEMA_SQL.to_string()
}
