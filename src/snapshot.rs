//! 配置快照构建器
//!
//! 把当前的 agent 配置行 + 系统默认值行映射为发布配置文档。
//! 纯函数，无 I/O；同一输入必须产生字节一致的输出
//! （列表全部排序、字段顺序固定），发布层靠这一点抑制多余的 reload。

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{AgentConfigRow, SystemDefaultRow, ValueType};

/// 单个 agent 的模型描述
///
/// 无回退时序列化为裸字符串，有回退时为 `{primary, fallbacks}` 结构。
/// 消费方依赖这个形状区分，不能统一成一种。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelSpec {
    Bare(String),
    WithFallbacks {
        primary: String,
        fallbacks: Vec<String>,
    },
}

/// 发布文档中的 agent 条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub name: String,
    pub model: ModelSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_subagents: Option<Vec<String>>,
}

/// 全局设置（白名单 key；结构体字段顺序即序列化顺序）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_spawn_depth: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<i64>,
}

/// 发布配置文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    /// 模型白名单: 所有主模型 + 回退模型的排序并集
    pub models: Vec<String>,
    /// 按名字排序的 agent 列表
    pub agents: Vec<AgentEntry>,
    pub settings: Settings,
}

impl ConfigDocument {
    /// 规范序列化（固定字段顺序 + 末尾换行）
    pub fn to_canonical_bytes(&self) -> crate::error::Result<Vec<u8>> {
        let mut out = serde_json::to_vec_pretty(self)?;
        out.push(b'\n');
        Ok(out)
    }
}

/// 识别的系统默认 key
///
/// 封闭枚举而非自由字符串分发: 新增 key 是编译期可见的变更。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultKey {
    /// 委派深度上限，整数，收敛到 1-5
    MaxSpawnDepth,
    /// 未配置 agent 的缺省模型
    DefaultModel,
    /// 轮询周期毫秒数，整数，收敛到 100-60000
    PollIntervalMs,
}

impl DefaultKey {
    /// 识别 key；不认识的返回 None（调用方忽略）
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "max_spawn_depth" => Some(DefaultKey::MaxSpawnDepth),
            "default_model" => Some(DefaultKey::DefaultModel),
            "poll_interval_ms" => Some(DefaultKey::PollIntervalMs),
            _ => None,
        }
    }
}

/// 委派深度的合法区间
pub const MAX_SPAWN_DEPTH_RANGE: (i64, i64) = (1, 5);
const POLL_INTERVAL_RANGE: (i64, i64) = (100, 60_000);

/// 构建发布文档
pub fn build(agents: &[AgentConfigRow], defaults: &[SystemDefaultRow]) -> ConfigDocument {
    // 模型白名单: 主模型 + 所有回退模型，排序去重
    let mut models: BTreeSet<String> = BTreeSet::new();
    for row in agents {
        models.insert(row.model.clone());
        if let Some(fallbacks) = &row.fallback_models {
            for m in fallbacks {
                models.insert(m.clone());
            }
        }
    }

    // agent 列表按名字排序
    let mut sorted: Vec<&AgentConfigRow> = agents.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let entries = sorted
        .into_iter()
        .map(|row| {
            // 回退列表保持存储顺序（它是优先级序，不排序）
            let model = match &row.fallback_models {
                Some(fallbacks) if !fallbacks.is_empty() => ModelSpec::WithFallbacks {
                    primary: row.model.clone(),
                    fallbacks: fallbacks.clone(),
                },
                _ => ModelSpec::Bare(row.model.clone()),
            };

            let allowed_subagents = row.allowed_subagents.as_ref().map(|list| {
                let mut list = list.clone();
                list.sort();
                list
            });

            // reasoning_effort 刻意不进文档: 它在 spawn 时消费，不在配置加载时
            AgentEntry {
                name: row.name.clone(),
                model,
                allowed_subagents,
            }
        })
        .collect();

    let mut settings = Settings::default();
    for row in defaults {
        apply_default(&mut settings, row);
    }

    ConfigDocument {
        models: models.into_iter().collect(),
        agents: entries,
        settings,
    }
}

/// 应用一条系统默认值
///
/// 未识别的 key 忽略；类型不匹配跳过并告警，绝不让一条坏行挡住整次重建。
fn apply_default(settings: &mut Settings, row: &SystemDefaultRow) {
    let Some(key) = DefaultKey::parse(&row.key) else {
        tracing::debug!("忽略未识别的系统默认 key: {}", row.key);
        return;
    };

    match key {
        DefaultKey::MaxSpawnDepth => {
            if let Some(v) = parse_integer(row) {
                settings.max_spawn_depth = Some(clamp_range(&row.key, v, MAX_SPAWN_DEPTH_RANGE));
            }
        }
        DefaultKey::DefaultModel => {
            if let Some(v) = parse_string(row) {
                settings.default_model = Some(v);
            }
        }
        DefaultKey::PollIntervalMs => {
            if let Some(v) = parse_integer(row) {
                settings.poll_interval_ms = Some(clamp_range(&row.key, v, POLL_INTERVAL_RANGE));
            }
        }
    }
}

fn parse_integer(row: &SystemDefaultRow) -> Option<i64> {
    if row.value_type != ValueType::Integer {
        tracing::warn!(
            "系统默认 {} 类型标签是 {}，期望 integer，跳过",
            row.key,
            row.value_type
        );
        return None;
    }

    match row.value.trim().parse::<i64>() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("系统默认 {} 解析失败 ({:?}): {}，跳过", row.key, row.value, e);
            None
        }
    }
}

fn parse_string(row: &SystemDefaultRow) -> Option<String> {
    if row.value_type != ValueType::String {
        tracing::warn!(
            "系统默认 {} 类型标签是 {}，期望 string，跳过",
            row.key,
            row.value_type
        );
        return None;
    }
    Some(row.value.clone())
}

/// 越界收敛到边界，不拒绝
fn clamp_range(key: &str, value: i64, (lo, hi): (i64, i64)) -> i64 {
    let clamped = value.clamp(lo, hi);
    if clamped != value {
        tracing::warn!("系统默认 {} = {} 越界，收敛到 {}", key, value, clamped);
    }
    clamped
}
