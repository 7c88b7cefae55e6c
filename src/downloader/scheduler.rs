// src/downloader/scheduler.rs

use super::{
    DownloadEngine, Muxer, StreamRefresh, TaskEvent,
    runner::{self, Command, Interrupt},
    store::{self, QueueFile},
    task::{DownloadTask, TaskRequest, TaskState},
};
use crate::{config::EngineConfig, constants, error::*, models::StreamSelection};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct QueueState {
    tasks: Vec<DownloadTask>,
    next_id: u64,
    next_seq: u64,
}

impl QueueState {
    fn get(&self, id: u64) -> AppResult<&DownloadTask> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or(AppError::TaskNotFound(id))
    }

    fn get_mut(&mut self, id: u64) -> AppResult<&mut DownloadTask> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(AppError::TaskNotFound(id))
    }

    fn active_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.state.is_active()).count()
    }

    fn take_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// 调度器与各任务执行器共享的状态。队列只在持有 `queue` 锁时修改。
pub(super) struct Shared {
    pub(super) config: EngineConfig,
    pub(super) engine: Arc<dyn DownloadEngine>,
    pub(super) muxer: Arc<dyn Muxer>,
    pub(super) refresher: Option<Arc<dyn StreamRefresh>>,
    queue: Mutex<QueueState>,
    controls: DashMap<u64, watch::Sender<Command>>,
    events: broadcast::Sender<TaskEvent>,
    /// 为真时不再启动排队中的任务
    draining: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TaskEvent) {
        // 没有订阅者时发送失败是正常的
        let _ = self.events.send(event);
    }

    fn transition(&self, q: &mut QueueState, id: u64, next: TaskState) -> AppResult<()> {
        let task = q.get_mut(id)?;
        if !task.state.can_transition_to(&next) {
            return Err(AppError::InvalidOperation(format!(
                "任务 #{} 无法从「{}」变为「{}」",
                id, task.state, next
            )));
        }
        info!("任务 #{}: {} -> {}", id, task.state, next);
        task.state = next.clone();
        self.emit(TaskEvent::StateChanged { id, state: next });
        Ok(())
    }

    fn persist(&self, q: &QueueState) {
        if !self.config.persist_queue {
            return;
        }
        let file = QueueFile {
            version: constants::QUEUE_FORMAT_VERSION,
            next_id: q.next_id,
            tasks: q.tasks.clone(),
        };
        if let Err(e) = store::save_queue(&self.config.queue_file(), &file) {
            error!("保存任务队列失败: {}", e);
        }
    }

    /// 按进入 `Queued` 的先后顺序填满空闲名额
    fn pump(self: &Arc<Self>, q: &mut QueueState) {
        if self.draining.load(Ordering::SeqCst) {
            debug!("正在停止调度，不启动排队中的任务");
            return;
        }
        while q.active_count() < self.config.max_concurrent {
            let Some(id) = q
                .tasks
                .iter()
                .filter(|t| t.state == TaskState::Queued)
                .min_by_key(|t| t.queued_seq)
                .map(|t| t.id)
            else {
                break;
            };
            if let Err(e) = self.start_runner(q, id) {
                error!("启动任务 #{} 失败: {}", id, e);
                break;
            }
        }
    }

    fn start_runner(self: &Arc<Self>, q: &mut QueueState, id: u64) -> AppResult<()> {
        self.transition(q, id, TaskState::Downloading)?;
        let (tx, rx) = watch::channel(Command::Run);
        self.controls.insert(id, tx);
        tokio::spawn(runner::run(self.clone(), id, rx));
        Ok(())
    }

    fn send(&self, id: u64, command: Command) {
        match self.controls.get(&id) {
            Some(tx) => {
                let _ = tx.send(command);
            }
            None => warn!("任务 #{} 没有正在运行的执行器", id),
        }
    }

    // --- 以下供执行器调用 ---

    pub(super) fn task(&self, id: u64) -> AppResult<DownloadTask> {
        self.lock().get(id).cloned()
    }

    /// 下载完成后进入合并。
    ///
    /// 暂停与取消都在持有队列锁时发出，所以在锁内读取指令后再切换状态，
    /// 已被受理的指令不会因为进入合并而丢失。返回 `Some` 时状态不变。
    pub(super) fn enter_merging(
        &self,
        id: u64,
        commands: &mut watch::Receiver<Command>,
    ) -> AppResult<Option<Interrupt>> {
        let mut q = self.lock();
        if let Some(interrupt) = runner::pending_interrupt(commands) {
            return Ok(Some(interrupt));
        }
        self.transition(&mut q, id, TaskState::Merging)?;
        self.persist(&q);
        Ok(None)
    }

    pub(super) fn update_selection(&self, id: u64, selection: StreamSelection) -> AppResult<()> {
        let mut q = self.lock();
        q.get_mut(id)?.selection = selection;
        self.persist(&q);
        Ok(())
    }

    /// 在未超过上限时记一次自动重试，返回新的重试次数
    pub(super) fn bump_retry(&self, id: u64) -> AppResult<Option<u32>> {
        let mut q = self.lock();
        let task = q.get_mut(id)?;
        if task.retry_count >= self.config.max_retries {
            return Ok(None);
        }
        task.retry_count += 1;
        let count = task.retry_count;
        self.persist(&q);
        Ok(Some(count))
    }

    /// 合并各码流的最新读数，字节数只增不减。返回 (已完成, 总量)。
    pub(super) fn apply_progress(
        &self,
        id: u64,
        updates: &[(usize, u64, u64)],
    ) -> AppResult<(u64, u64)> {
        let mut q = self.lock();
        let task = q.get_mut(id)?;
        for &(idx, completed, total) in updates {
            if let Some(stream) = task.streams.get_mut(idx) {
                if total > 0 {
                    stream.total = total;
                }
                stream.completed = stream.completed.max(completed);
            }
        }
        Ok((task.completed_bytes(), task.total_bytes()))
    }

    pub(super) fn publish_progress(&self, id: u64, completed: u64, total: u64, speed: u64) {
        self.emit(TaskEvent::Progress {
            id,
            completed,
            total,
            speed,
        });
        self.persist(&self.lock());
    }

    /// 执行器退出时发布最终状态并释放名额。
    ///
    /// `cancel` 一旦返回成功，任务最终一定是 `Cancelled`: 执行器已经结束但
    /// 指令还没来得及处理时，在这里删除文件并改为取消。
    pub(super) fn finish(self: &Arc<Self>, id: u64, next: TaskState) {
        let mut q = self.lock();
        let cancel_accepted = self
            .controls
            .remove(&id)
            .is_some_and(|(_, tx)| *tx.borrow() == Command::Cancel);
        let next = match q.get(id) {
            Ok(task) if cancel_accepted && next != TaskState::Cancelled => {
                info!("任务 #{} 在结束前已被取消", id);
                remove_files_blocking(&task.all_files());
                TaskState::Cancelled
            }
            _ => next,
        };
        if let Err(e) = self.transition(&mut q, id, next) {
            error!("任务 #{} 的最终状态无法生效: {}", id, e);
        }
        self.persist(&q);
        self.pump(&mut q);
    }
}

/// 任务队列。所有修改都经由这里的操作完成，读取方拿到的是一致的快照。
#[derive(Clone)]
pub struct QueueScheduler {
    shared: Arc<Shared>,
}

impl QueueScheduler {
    pub fn new(
        config: EngineConfig,
        engine: Arc<dyn DownloadEngine>,
        muxer: Arc<dyn Muxer>,
        refresher: Option<Arc<dyn StreamRefresh>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                engine,
                muxer,
                refresher,
                queue: Mutex::new(QueueState {
                    next_id: 1,
                    ..Default::default()
                }),
                controls: DashMap::new(),
                events,
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }

    pub fn snapshot(&self) -> Vec<DownloadTask> {
        self.shared.lock().tasks.clone()
    }

    pub fn task(&self, id: u64) -> Option<DownloadTask> {
        self.shared.lock().get(id).ok().cloned()
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().active_count()
    }

    /// 读取上次保存的队列并继续调度。返回恢复的任务数。
    pub fn restore(&self) -> AppResult<usize> {
        if !self.shared.config.persist_queue {
            return Ok(0);
        }
        let Some(file) = store::load_queue(&self.shared.config.queue_file())? else {
            return Ok(0);
        };
        let mut q = self.shared.lock();
        let count = file.tasks.len();
        q.next_seq = file.tasks.iter().map(|t| t.queued_seq).max().unwrap_or(0);
        q.next_id = file.next_id.max(q.next_id);
        q.tasks = file.tasks;
        self.shared.persist(&q);
        self.shared.pump(&mut q);
        Ok(count)
    }

    pub fn enqueue(&self, request: TaskRequest) -> AppResult<u64> {
        let mut q = self.shared.lock();
        if let Some(existing) = q.tasks.iter().find(|t| {
            !t.state.is_terminal()
                && t.video == request.video
                && t.part.cid == request.part.cid
                && t.mode == request.mode
        }) {
            return Err(AppError::InvalidOperation(format!(
                "该分P已在队列中 (任务 #{})",
                existing.id
            )));
        }

        let id = q.next_id;
        q.next_id += 1;
        let seq = q.take_seq();
        let task = DownloadTask::new(id, seq, request, &self.shared.config);
        info!("新任务 #{}: {}", id, task.display_name());
        self.shared.emit(TaskEvent::Added {
            id,
            name: task.display_name(),
        });
        q.tasks.push(task);
        self.shared.persist(&q);
        self.shared.pump(&mut q);
        Ok(id)
    }

    /// 只能暂停正在下载的任务。进程结束后任务才会变为 `Paused`。
    pub fn pause(&self, id: u64) -> AppResult<()> {
        let q = self.shared.lock();
        let task = q.get(id)?;
        if task.state != TaskState::Downloading {
            return Err(AppError::InvalidOperation(format!(
                "只有下载中的任务可以暂停 (任务 #{} 当前{})",
                id, task.state
            )));
        }
        debug!("暂停任务 #{}", id);
        self.shared.send(id, Command::Pause);
        Ok(())
    }

    /// 有空闲名额时直接继续下载，否则重新排队。
    pub fn resume(&self, id: u64) -> AppResult<()> {
        let mut q = self.shared.lock();
        let state = q.get(id)?.state.clone();
        if state != TaskState::Paused {
            return Err(AppError::InvalidOperation(format!(
                "只有已暂停的任务可以继续 (任务 #{} 当前{})",
                id, state
            )));
        }
        if !self.shared.draining.load(Ordering::SeqCst)
            && q.active_count() < self.shared.config.max_concurrent
        {
            self.shared.start_runner(&mut q, id)?;
        } else {
            let seq = q.take_seq();
            q.get_mut(id)?.queued_seq = seq;
            self.shared.transition(&mut q, id, TaskState::Queued)?;
        }
        self.shared.persist(&q);
        Ok(())
    }

    /// 任意状态下都可以取消。
    ///
    /// 正在运行的任务只发送取消信号，由执行器结束进程、清理文件后发布 `Cancelled`；
    /// 其余任务在这里直接清理。
    pub fn cancel(&self, id: u64) -> AppResult<()> {
        let mut q = self.shared.lock();
        let task = q.get(id)?;
        let (state, files) = (task.state.clone(), task.all_files());
        match state {
            TaskState::Completed | TaskState::Cancelled => Ok(()),
            TaskState::Downloading | TaskState::Merging => {
                debug!("取消运行中的任务 #{}", id);
                self.shared.send(id, Command::Cancel);
                Ok(())
            }
            TaskState::Queued | TaskState::Paused | TaskState::Failed { .. } => {
                remove_files_blocking(&files);
                self.shared.transition(&mut q, id, TaskState::Cancelled)?;
                self.shared.persist(&q);
                Ok(())
            }
        }
    }

    /// 从队列中删除终态任务，不会删除已下载的文件。
    pub fn remove(&self, id: u64) -> AppResult<()> {
        let mut q = self.shared.lock();
        let task = q.get(id)?;
        if !task.state.is_terminal() {
            return Err(AppError::InvalidOperation(format!(
                "只能移除已结束的任务 (任务 #{} 当前{})",
                id, task.state
            )));
        }
        q.tasks.retain(|t| t.id != id);
        info!("任务 #{} 已从队列移除", id);
        self.shared.emit(TaskEvent::Removed { id });
        self.shared.persist(&q);
        Ok(())
    }

    /// 失败的任务重新排队，重试计数清零。
    pub fn retry(&self, id: u64) -> AppResult<()> {
        let mut q = self.shared.lock();
        if !matches!(q.get(id)?.state, TaskState::Failed { .. }) {
            return Err(AppError::InvalidOperation(format!(
                "只有失败的任务可以重试 (任务 #{})",
                id
            )));
        }
        let seq = q.take_seq();
        let task = q.get_mut(id)?;
        task.retry_count = 0;
        task.queued_seq = seq;
        self.shared.transition(&mut q, id, TaskState::Queued)?;
        self.shared.persist(&q);
        self.shared.pump(&mut q);
        Ok(())
    }

    /// 暂停所有下载中的任务并等待进程退出，合并中的任务不受影响。
    ///
    /// 此后排队中的任务不会再被启动，直到调用 [`resume_scheduling`](Self::resume_scheduling)。
    pub async fn pause_all(&self) {
        self.shared.draining.store(true, Ordering::SeqCst);
        let mut events = self.subscribe();
        let downloading: Vec<u64> = self
            .snapshot()
            .into_iter()
            .filter(|t| t.state == TaskState::Downloading)
            .map(|t| t.id)
            .collect();
        for id in &downloading {
            let _ = self.pause(*id);
        }
        while self
            .snapshot()
            .iter()
            .any(|t| downloading.contains(&t.id) && t.state == TaskState::Downloading)
        {
            if let Err(broadcast::error::RecvError::Closed) = events.recv().await {
                break;
            }
        }
    }

    /// 撤销 `pause_all` 的停止调度，按顺序启动排队中的任务。
    pub fn resume_scheduling(&self) {
        self.shared.draining.store(false, Ordering::SeqCst);
        let mut q = self.shared.lock();
        self.shared.pump(&mut q);
    }

    /// 等待直到没有排队、下载或合并中的任务。
    pub async fn wait_until_settled(&self) {
        let mut events = self.subscribe();
        loop {
            let busy = self
                .snapshot()
                .iter()
                .any(|t| t.state.is_active() || t.state == TaskState::Queued);
            if !busy {
                return;
            }
            if let Err(broadcast::error::RecvError::Closed) = events.recv().await {
                return;
            }
        }
    }
}

fn remove_files_blocking(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("已删除 {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("删除 {} 失败: {}", path.display(), e),
        }
    }
}
