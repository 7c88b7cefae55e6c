// src/downloader/store.rs

//! 任务队列的持久化。写入时先落到同目录的临时文件再原子替换。

use super::task::{DownloadTask, TaskState};
use crate::{constants, error::*};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{BufWriter, Write},
    path::Path,
};
use tempfile::NamedTempFile;

fn current_version() -> u32 {
    constants::QUEUE_FORMAT_VERSION
}

/// `queue.json` 的内容。未知字段会被忽略，缺失字段取默认值。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueFile {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub tasks: Vec<DownloadTask>,
}

pub fn save_queue(path: &Path, queue: &QueueFile) -> AppResult<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer_pretty(&mut writer, queue)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path)?;
    debug!("队列已保存: {} 个任务", queue.tasks.len());
    Ok(())
}

/// 读取队列文件。文件不存在时返回 `None`。
///
/// 上次退出时仍在下载或合并的任务恢复为 `Queued`，其余状态保持不变。
pub fn load_queue(path: &Path) -> AppResult<Option<QueueFile>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let mut queue: QueueFile = serde_json::from_str(&content)?;
    if queue.version > constants::QUEUE_FORMAT_VERSION {
        warn!(
            "队列文件版本 {} 高于当前支持的版本 {}，将尽量兼容读取",
            queue.version,
            constants::QUEUE_FORMAT_VERSION
        );
    }

    let mut restored = 0;
    for task in &mut queue.tasks {
        if task.state.is_active() {
            task.state = TaskState::Queued;
            restored += 1;
        }
    }
    let max_id = queue.tasks.iter().map(|t| t.id).max().unwrap_or(0);
    queue.next_id = queue.next_id.max(max_id + 1);
    queue.version = constants::QUEUE_FORMAT_VERSION;

    info!(
        "从 {} 读取到 {} 个任务 ({} 个中断的任务重新排队)",
        path.display(),
        queue.tasks.len(),
        restored
    );
    Ok(Some(queue))
}
