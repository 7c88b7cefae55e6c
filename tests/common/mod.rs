// tests/common/mod.rs

#![allow(dead_code)]

use async_trait::async_trait;
use bili_dl::config::EngineConfig;
use bili_dl::downloader::{
    DownloadEngine, DownloadTask, MuxProcess, MuxRequest, Muxer, QueueScheduler, TaskRequest,
    TaskState, Transfer, TransferRequest, TransferStatus,
};
use bili_dl::error::{AppError, AppResult};
use bili_dl::models::{
    DownloadMode, QualityTier, StreamDescriptor, StreamKind, StreamSelection, VideoPart,
};
use bili_dl::resolver::find_bvid;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const STREAM_SIZE: u64 = 1000;

/// 在传输或合并的特定时刻执行一次的回调
pub type Hook = Box<dyn FnOnce() + Send>;

fn run_hook(slot: &Mutex<Option<Hook>>) {
    let hook = slot.lock().unwrap().take();
    if let Some(hook) = hook {
        hook();
    }
}

/// 下载引擎与传输共享的可控状态
#[derive(Default)]
pub struct EngineState {
    /// 每次轮询前进的字节数
    pub step: AtomicU64,
    /// 非零时，未放行的传输停在这个字节数
    pub stall_at: AtomicU64,
    /// 目标路径包含其中任意片段的传输不受 `stall_at` 限制
    pub released: Mutex<HashSet<String>>,
    /// 接下来这么多次启动的传输会在第一次轮询时失败
    pub fail_next: AtomicUsize,
    pub fail_transient: AtomicBool,
    pub requests: Mutex<Vec<TransferRequest>>,
    /// 实际"下载"的字节总数
    pub acquired: AtomicU64,
    pub terminated: AtomicUsize,
    /// 第一条码流下载完成时调用
    pub on_finish: Mutex<Option<Hook>>,
}

impl EngineState {
    pub fn release(&self, fragment: &str) {
        self.released.lock().unwrap().insert(fragment.to_string());
    }

    pub fn release_all(&self) {
        self.stall_at.store(0, Ordering::SeqCst);
    }

    fn limit_for(&self, destination: &Path) -> u64 {
        let stall = self.stall_at.load(Ordering::SeqCst);
        let dest = destination.to_string_lossy();
        let released = self
            .released
            .lock()
            .unwrap()
            .iter()
            .any(|f| dest.contains(f.as_str()));
        if stall == 0 || released {
            STREAM_SIZE
        } else {
            stall
        }
    }
}

pub struct FakeEngine {
    pub state: Arc<EngineState>,
}

impl FakeEngine {
    pub fn new(step: u64, stall_at: u64) -> Self {
        let state = EngineState::default();
        state.step.store(step, Ordering::SeqCst);
        state.stall_at.store(stall_at, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }
}

#[async_trait]
impl DownloadEngine for FakeEngine {
    async fn start(&self, request: &TransferRequest) -> AppResult<Box<dyn Transfer>> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.destination)?;
        self.state.requests.lock().unwrap().push(request.clone());
        let fail = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(Box::new(FakeTransfer {
            state: self.state.clone(),
            destination: request.destination.clone(),
            completed: request.offset,
            fail,
        }))
    }
}

struct FakeTransfer {
    state: Arc<EngineState>,
    destination: PathBuf,
    completed: u64,
    fail: bool,
}

#[async_trait]
impl Transfer for FakeTransfer {
    async fn poll(&mut self) -> AppResult<TransferStatus> {
        if self.fail {
            return Ok(TransferStatus::Failed {
                reason: "模拟的下载错误".to_string(),
                transient: self.state.fail_transient.load(Ordering::SeqCst),
            });
        }
        let limit = self.state.limit_for(&self.destination);
        let next = (self.completed + self.state.step.load(Ordering::SeqCst)).min(limit);
        if next > self.completed {
            self.state
                .acquired
                .fetch_add(next - self.completed, Ordering::SeqCst);
            self.completed = next;
        }
        if self.completed >= STREAM_SIZE {
            run_hook(&self.state.on_finish);
            Ok(TransferStatus::Finished { total: STREAM_SIZE })
        } else {
            Ok(TransferStatus::Running {
                completed: self.completed,
                total: STREAM_SIZE,
            })
        }
    }

    async fn terminate(&mut self) -> AppResult<()> {
        self.state.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MuxState {
    /// 为 true 时合并一直不结束
    pub hold: AtomicBool,
    pub fail: AtomicBool,
    pub started: AtomicUsize,
    pub terminated: AtomicUsize,
    /// 合并结束前调用
    pub on_wait: Mutex<Option<Hook>>,
}

pub struct FakeMuxer {
    pub state: Arc<MuxState>,
}

impl FakeMuxer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MuxState::default()),
        }
    }
}

#[async_trait]
impl Muxer for FakeMuxer {
    async fn start(&self, request: &MuxRequest) -> AppResult<Box<dyn MuxProcess>> {
        self.state.started.fetch_add(1, Ordering::SeqCst);
        // 合并过程中输出文件已经部分写出
        std::fs::write(&request.output, b"partial")?;
        Ok(Box::new(FakeMuxProcess {
            state: self.state.clone(),
        }))
    }
}

struct FakeMuxProcess {
    state: Arc<MuxState>,
}

#[async_trait]
impl MuxProcess for FakeMuxProcess {
    async fn wait(&mut self) -> AppResult<()> {
        run_hook(&self.state.on_wait);
        while self.state.hold.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if self.state.fail.load(Ordering::SeqCst) {
            return Err(AppError::MergeFailed("模拟的合并错误".to_string()));
        }
        Ok(())
    }

    async fn terminate(&mut self) -> AppResult<()> {
        self.state.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn engine_config(dir: &Path, max_concurrent: usize) -> EngineConfig {
    EngineConfig {
        download_dir: dir.to_path_buf(),
        max_concurrent,
        connections: 1,
        poll_interval: Duration::from_millis(10),
        max_retries: 2,
        retry_backoff: Duration::from_millis(10),
        persist_queue: true,
        ..EngineConfig::default()
    }
}

fn descriptor(kind: StreamKind) -> StreamDescriptor {
    StreamDescriptor {
        kind,
        tier: QualityTier::P1080,
        codec: if kind == StreamKind::Audio {
            "mp4a.40.2".to_string()
        } else {
            "avc1.640032".to_string()
        },
        urls: vec![format!("https://upos.example.com/{:?}.m4s", kind)],
        requires_session: false,
        bitrate: 1000,
        size: Some(STREAM_SIZE),
    }
}

/// 一个带视频和音频两条码流的请求，标题即文件名
pub fn request(title: &str, cid: u64) -> TaskRequest {
    TaskRequest {
        video: find_bvid("BV1xx411c7mD").unwrap(),
        title: title.to_string(),
        part: VideoPart {
            cid,
            index: 1,
            title: "P1".to_string(),
            duration: 60,
        },
        part_count: 1,
        mode: DownloadMode::VideoWithAudio,
        selection: StreamSelection {
            video: Some(descriptor(StreamKind::Video)),
            audio: Some(descriptor(StreamKind::Audio)),
        },
    }
}

pub fn scheduler_with(
    config: EngineConfig,
    engine: &FakeEngine,
    muxer: &FakeMuxer,
) -> QueueScheduler {
    QueueScheduler::new(
        config,
        Arc::new(FakeEngine {
            state: engine.state.clone(),
        }),
        Arc::new(FakeMuxer {
            state: muxer.state.clone(),
        }),
        None,
    )
}

/// 等待任务满足条件，超时则失败
pub async fn wait_for<F>(scheduler: &QueueScheduler, id: u64, what: &str, pred: F) -> DownloadTask
where
    F: Fn(&DownloadTask) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(task) = scheduler.task(id)
            && pred(&task)
        {
            return task;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "task #{} never reached {}: {:?}",
                id,
                what,
                scheduler.task(id).map(|t| t.state)
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(scheduler: &QueueScheduler, id: u64, state: TaskState) -> DownloadTask {
    let label = format!("{:?}", state);
    wait_for(scheduler, id, &label, move |t| t.state == state).await
}

pub fn states(scheduler: &QueueScheduler) -> Vec<(u64, TaskState)> {
    scheduler
        .snapshot()
        .into_iter()
        .map(|t| (t.id, t.state))
        .collect()
}

/// 放行某个任务的全部码流
pub fn release_task(engine: &FakeEngine, scheduler: &QueueScheduler, id: u64) {
    let task = scheduler.task(id).expect("task exists");
    for stream in &task.streams {
        engine.state.release(&stream.path.to_string_lossy());
    }
}
