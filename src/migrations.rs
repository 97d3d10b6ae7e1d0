//! 数据库迁移模块

use rusqlite::{Connection, Result as SqliteResult};
use tracing::info;

/// 迁移版本
const MIGRATION_VERSION: i64 = 2;

/// 初始化迁移系统
pub fn initialize_migrations(conn: &Connection) -> SqliteResult<()> {
    // 创建迁移版本表
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    Ok(())
}

/// 获取当前数据库版本
fn get_current_version(conn: &Connection) -> SqliteResult<i64> {
    let version: SqliteResult<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        });

    match version {
        Ok(v) => Ok(v),
        Err(_) => Ok(0), // 表为空时返回 0
    }
}

/// 记录迁移版本
fn record_migration(conn: &Connection, version: i64) -> SqliteResult<()> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        [version, now],
    )?;

    Ok(())
}

/// 检查表是否存在
fn table_exists(conn: &Connection, table: &str) -> SqliteResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// 检查列是否存在
fn column_exists(conn: &Connection, table: &str, column: &str) -> SqliteResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt.query_map([], |row| {
        let col_name: String = row.get(1)?;
        Ok(col_name)
    })?;

    for col_name in columns.flatten() {
        if col_name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

/// 迁移 1: deliveries 表添加 error_detail 列
///
/// 早期版本只记录失败时间，不记录失败原因。
fn migration_001_add_delivery_error_detail(conn: &Connection) -> SqliteResult<()> {
    // 如果表不存在，跳过迁移（schema 会创建完整表）
    if !table_exists(conn, "deliveries")? {
        return Ok(());
    }

    if !column_exists(conn, "deliveries", "error_detail")? {
        info!("Running migration 001: add deliveries.error_detail");
        conn.execute("ALTER TABLE deliveries ADD COLUMN error_detail TEXT", [])?;
    }

    Ok(())
}

/// 迁移 2: agent_configs 表添加 instance_role 列
fn migration_002_add_agent_instance_role(conn: &Connection) -> SqliteResult<()> {
    if !table_exists(conn, "agent_configs")? {
        return Ok(());
    }

    if !column_exists(conn, "agent_configs", "instance_role")? {
        info!("Running migration 002: add agent_configs.instance_role");
        conn.execute("ALTER TABLE agent_configs ADD COLUMN instance_role TEXT", [])?;
    }

    Ok(())
}

/// 执行所有未应用的迁移
pub fn run_migrations(conn: &Connection) -> SqliteResult<()> {
    initialize_migrations(conn)?;

    let current = get_current_version(conn)?;
    if current >= MIGRATION_VERSION {
        return Ok(());
    }

    if current < 1 {
        migration_001_add_delivery_error_detail(conn)?;
        record_migration(conn, 1)?;
    }

    if current < 2 {
        migration_002_add_agent_instance_role(conn)?;
        record_migration(conn, 2)?;
    }

    info!("Migrations complete (version {})", MIGRATION_VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_on_empty_db() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), MIGRATION_VERSION);

        // 再跑一次应该是 no-op
        run_migrations(&conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), MIGRATION_VERSION);
    }

    #[test]
    fn test_migration_adds_missing_column() {
        let conn = Connection::open_in_memory().unwrap();

        // 模拟老版本的 deliveries 表（无 error_detail）
        conn.execute_batch(
            r#"
            CREATE TABLE deliveries (
                message_id INTEGER NOT NULL,
                recipient TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'received',
                received_at INTEGER,
                routed_at INTEGER,
                responded_at INTEGER,
                failed_at INTEGER,
                PRIMARY KEY (message_id, recipient)
            );
            "#,
        )
        .unwrap();

        run_migrations(&conn).unwrap();
        assert!(column_exists(&conn, "deliveries", "error_detail").unwrap());
    }
}
