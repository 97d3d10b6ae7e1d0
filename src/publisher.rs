//! 原子发布器
//!
//! 把配置文档写到消费方读取的路径。读者在任何时刻看到的
//! 要么是上一个完整版本，要么是下一个完整版本，绝不是半成品:
//! 先写同目录唯一临时文件，再原子 rename 覆盖目标。

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::snapshot::ConfigDocument;

/// 发布文档到目标路径
///
/// 返回内容是否真的变了（与旧内容逐字节比较），调用方用它抑制多余的 reload 信号。
/// rename 之前的任何失败都不触碰目标路径；临时文件尽力清理。
pub fn publish(document: &ConfigDocument, target: &Path) -> Result<bool> {
    let bytes = document.to_canonical_bytes()?;

    let previous = match fs::read(target) {
        Ok(b) => Some(b),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| Error::Config(format!("目标路径没有父目录: {:?}", target)))?;
    fs::create_dir_all(dir)?;

    // 同目录临时文件，保证 rename 不跨文件系统
    let tmp = temp_path(dir, target);
    let result = write_and_rename(&bytes, &tmp, target);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result?;

    Ok(previous.as_deref() != Some(bytes.as_slice()))
}

/// 生成同目录唯一临时路径
fn temp_path(dir: &Path, target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "config".to_string());
    dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

fn write_and_rename(bytes: &[u8], tmp: &Path, target: &Path) -> Result<()> {
    let mut file = fs::File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{build, Settings};
    use crate::types::{AgentConfigRow, SystemDefaultRow, ValueType};
    use tempfile::TempDir;

    fn sample_document() -> ConfigDocument {
        let agents = vec![AgentConfigRow {
            name: "coder".to_string(),
            model: "m1".to_string(),
            fallback_models: Some(vec!["m2".to_string()]),
            reasoning_effort: None,
            instance_role: None,
            allowed_subagents: None,
            updated_at: 0,
        }];
        let defaults = vec![SystemDefaultRow {
            key: "max_spawn_depth".to_string(),
            value: "3".to_string(),
            value_type: ValueType::Integer,
            updated_at: 0,
        }];
        build(&agents, &defaults)
    }

    #[test]
    fn test_publish_writes_document() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("agents.json");

        let doc = sample_document();
        let changed = publish(&doc, &target).unwrap();
        assert!(changed);

        let content = fs::read(&target).unwrap();
        assert_eq!(content, doc.to_canonical_bytes().unwrap());
        // 末尾有换行
        assert_eq!(content.last(), Some(&b'\n'));
    }

    #[test]
    fn test_publish_creates_parent_dir() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("nested").join("dir").join("agents.json");

        publish(&sample_document(), &target).unwrap();
        assert!(target.exists());
    }

    #[test]
    fn test_republish_identical_reports_unchanged() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("agents.json");

        let doc = sample_document();
        assert!(publish(&doc, &target).unwrap());
        assert!(!publish(&doc, &target).unwrap());

        // 内容变化后重新报告 changed
        let mut doc2 = doc.clone();
        doc2.settings = Settings {
            max_spawn_depth: Some(2),
            ..doc.settings.clone()
        };
        assert!(publish(&doc2, &target).unwrap());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("agents.json");

        publish(&sample_document(), &target).unwrap();
        publish(&sample_document(), &target).unwrap();

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_failed_publish_leaves_target_untouched() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("agents.json");

        let doc = sample_document();
        publish(&doc, &target).unwrap();
        let before = fs::read(&target).unwrap();

        // 让 rename 失败: 目标换成一个非空目录
        let bad_target = tmp.path().join("occupied");
        fs::create_dir(&bad_target).unwrap();
        fs::write(bad_target.join("x"), b"y").unwrap();

        let mut doc2 = doc.clone();
        doc2.settings.max_spawn_depth = Some(1);
        assert!(publish(&doc2, &bad_target).is_err());

        // 原目标不受影响；失败目标仍是原来的目录
        assert_eq!(fs::read(&target).unwrap(), before);
        assert!(bad_target.is_dir());

        // 临时文件被清理
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
