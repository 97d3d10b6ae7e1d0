//! 消费进程 reload 信号
//!
//! 发布成功且内容变化后，通知消费进程重读配置文档。
//! 契约只是"信号存在，消费方收到后从固定路径重读"。

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// reload 信号方式
#[derive(Debug, Clone)]
pub enum ReloadSignal {
    /// 不发信号（消费方自行轮询文件）
    Disabled,
    /// 读取 pid 文件，向消费进程发送 SIGHUP
    PidFile(PathBuf),
}

impl ReloadSignal {
    /// 发送 reload 信号，返回是否实际发出
    ///
    /// pid 文件缺失/损坏、目标进程不存在都不算错误 —— 消费方
    /// 不在线时发布照常进行，信号只是尽力而为。
    pub fn send(&self) -> Result<bool> {
        match self {
            ReloadSignal::Disabled => Ok(false),
            ReloadSignal::PidFile(path) => {
                let Some(pid) = read_pid(path) else {
                    tracing::debug!("pid 文件不可用，跳过 reload 信号: {:?}", path);
                    return Ok(false);
                };

                #[cfg(unix)]
                {
                    let ok = unsafe { libc::kill(pid, libc::SIGHUP) } == 0;
                    if ok {
                        tracing::debug!("已发送 SIGHUP: pid={}", pid);
                    } else {
                        tracing::warn!("发送 SIGHUP 失败: pid={}", pid);
                    }
                    Ok(ok)
                }

                #[cfg(not(unix))]
                {
                    let _ = pid;
                    Ok(false)
                }
            }
        }
    }
}

/// 读取 pid 文件
fn read_pid(path: &Path) -> Option<i32> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}
