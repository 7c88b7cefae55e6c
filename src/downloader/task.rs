// src/downloader/task.rs

use crate::{
    config::EngineConfig,
    models::{AudioFormat, DownloadMode, StreamKind, StreamSelection, VideoId, VideoPart},
    utils,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// 下载任务的状态。
///
/// `Queued → Downloading → Merging → Completed`，
/// `Downloading ⇄ Paused`，任意活动状态都可能进入 `Failed` 或 `Cancelled`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Downloading,
    Paused,
    Merging,
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl TaskState {
    /// 占用并发名额的状态
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Downloading | TaskState::Merging)
    }

    /// 只有终态任务可以从队列中移除
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed { .. } | TaskState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Queued, Downloading) => true,
            (Downloading, Paused | Merging) => true,
            (Paused, Downloading | Queued) => true,
            (Merging, Completed) => true,
            // 重试
            (Failed { .. }, Queued) => true,
            (Completed | Cancelled, _) => false,
            (_, Failed { .. }) => !matches!(self, Failed { .. }),
            (_, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Queued => write!(f, "排队中"),
            TaskState::Downloading => write!(f, "下载中"),
            TaskState::Paused => write!(f, "已暂停"),
            TaskState::Merging => write!(f, "合并中"),
            TaskState::Completed => write!(f, "已完成"),
            TaskState::Failed { reason } => write!(f, "失败: {}", reason),
            TaskState::Cancelled => write!(f, "已取消"),
        }
    }
}

/// 单个码流的落盘位置和字节进度。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProgress {
    pub kind: StreamKind,
    pub path: PathBuf,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub total: u64,
}

impl StreamProgress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed >= self.total
    }

    /// 下载引擎用于断点续传的控制文件
    pub fn control_file(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".aria2");
        PathBuf::from(name)
    }
}

/// 调用方确认画质后提交给调度器的下载请求。
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub video: VideoId,
    pub title: String,
    pub part: VideoPart,
    /// 视频共有几个分P，多P时文件名带上分P标题
    pub part_count: usize,
    pub mode: DownloadMode,
    pub selection: StreamSelection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: u64,
    pub video: VideoId,
    pub title: String,
    pub part: VideoPart,
    #[serde(default)]
    pub mode: DownloadMode,
    #[serde(default)]
    pub audio_format: AudioFormat,
    pub selection: StreamSelection,
    #[serde(default)]
    pub streams: Vec<StreamProgress>,
    pub output_path: PathBuf,
    pub state: TaskState,
    #[serde(default)]
    pub retry_count: u32,
    /// 进入 `Queued` 的先后顺序，决定 FIFO 提升
    #[serde(default)]
    pub queued_seq: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl DownloadTask {
    pub fn new(id: u64, seq: u64, request: TaskRequest, config: &EngineConfig) -> Self {
        let stem = file_stem(&request);
        let dir = &config.download_dir;

        let extension = match request.mode {
            DownloadMode::VideoWithAudio => "mp4",
            DownloadMode::AudioOnly => config.audio_format.extension(),
        };
        let output_path = dir.join(format!("{}.{}", stem, extension));

        let mut streams = Vec::new();
        for descriptor in [&request.selection.video, &request.selection.audio]
            .into_iter()
            .flatten()
        {
            let suffix = match descriptor.kind {
                StreamKind::Video => "video.m4s",
                StreamKind::Audio => "audio.m4s",
                StreamKind::Muxed => "flv",
            };
            streams.push(StreamProgress {
                kind: descriptor.kind,
                path: dir.join(format!("{}.{}.{}", stem, id, suffix)),
                completed: 0,
                total: descriptor.size.unwrap_or(0),
            });
        }

        Self {
            id,
            video: request.video,
            title: request.title,
            part: request.part,
            mode: request.mode,
            audio_format: config.audio_format,
            selection: request.selection,
            streams,
            output_path,
            state: TaskState::Queued,
            retry_count: 0,
            queued_seq: seq,
            created_at: Utc::now(),
        }
    }

    pub fn completed_bytes(&self) -> u64 {
        self.streams.iter().map(|s| s.completed).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.streams.iter().map(|s| s.total).sum()
    }

    /// 曾经开始过下载 (有部分数据或失败重试过)
    pub fn has_started(&self) -> bool {
        self.retry_count > 0 || self.streams.iter().any(|s| s.completed > 0)
    }

    /// 中间文件: 各码流文件及其续传控制文件
    pub fn intermediate_files(&self) -> Vec<PathBuf> {
        self.streams
            .iter()
            .flat_map(|s| [s.path.clone(), s.control_file()])
            .collect()
    }

    /// 与任务相关的全部文件，包括最终产物
    pub fn all_files(&self) -> Vec<PathBuf> {
        let mut files = self.intermediate_files();
        files.push(self.output_path.clone());
        files
    }

    pub fn display_name(&self) -> String {
        self.output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.title.clone())
    }
}

fn file_stem(request: &TaskRequest) -> String {
    let raw = if request.part_count > 1 {
        format!(
            "{} - P{} {}",
            request.title, request.part.index, request.part.title
        )
    } else {
        request.title.clone()
    };
    utils::sanitize_filename(&raw)
}
