// src/downloader/mod.rs

mod backend;
mod runner;
mod scheduler;
mod store;
mod task;

pub use backend::{
    Aria2Engine, Aria2Readout, DownloadEngine, FfmpegMuxer, MuxProcess, MuxRequest, Muxer,
    Transfer, TransferRequest, TransferStatus, classify_aria2_exit, ffmpeg_args,
    parse_aria2_readout,
};
pub use scheduler::QueueScheduler;
pub use store::{QueueFile, load_queue, save_queue};
pub use task::{DownloadTask, StreamProgress, TaskRequest, TaskState};

use crate::{
    error::AppResult,
    models::{StreamSelection, VideoId, VideoPart},
};
use async_trait::async_trait;

/// 调度器向订阅者发布的通知。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Added {
        id: u64,
        name: String,
    },
    StateChanged {
        id: u64,
        state: TaskState,
    },
    Progress {
        id: u64,
        completed: u64,
        total: u64,
        /// 字节/秒
        speed: u64,
    },
    Removed {
        id: u64,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> u64 {
        match self {
            TaskEvent::Added { id, .. }
            | TaskEvent::StateChanged { id, .. }
            | TaskEvent::Progress { id, .. }
            | TaskEvent::Removed { id } => *id,
        }
    }
}

/// 码流地址有时效，任务重新开始下载前用它换取同一码流的新地址。
#[async_trait]
pub trait StreamRefresh: Send + Sync {
    async fn refresh(
        &self,
        video: &VideoId,
        part: &VideoPart,
        selection: &StreamSelection,
    ) -> AppResult<StreamSelection>;
}
