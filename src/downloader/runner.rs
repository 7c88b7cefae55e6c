// src/downloader/runner.rs

//! 单个任务的执行器: 启动下载进程、轮询进度、处理暂停/取消、失败重试与合并。

use super::{
    MuxRequest, Transfer, TransferRequest, TransferStatus,
    scheduler::Shared,
    task::{DownloadTask, TaskState},
};
use crate::error::*;
use log::{debug, error, info, warn};
use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::watch, time::MissedTickBehavior};

/// 调度器发给执行器的指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Command {
    Run,
    Pause,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Interrupt {
    Pause,
    Cancel,
}

fn interrupt_of(command: Command) -> Option<Interrupt> {
    match command {
        Command::Run => None,
        Command::Pause => Some(Interrupt::Pause),
        Command::Cancel => Some(Interrupt::Cancel),
    }
}

/// 读取尚未处理的指令。发送端已关闭视为取消。
pub(super) fn pending_interrupt(commands: &mut watch::Receiver<Command>) -> Option<Interrupt> {
    match commands.has_changed() {
        Err(_) => Some(Interrupt::Cancel),
        Ok(_) => interrupt_of(*commands.borrow_and_update()),
    }
}

async fn next_interrupt(commands: &mut watch::Receiver<Command>) -> Option<Interrupt> {
    if commands.changed().await.is_err() {
        return Some(Interrupt::Cancel);
    }
    interrupt_of(*commands.borrow_and_update())
}

pub(super) async fn run(shared: Arc<Shared>, id: u64, mut commands: watch::Receiver<Command>) {
    let next = match drive(&shared, id, &mut commands).await {
        Ok(state) => state,
        Err(e) => {
            error!("任务 #{} 失败: {}", id, e);
            TaskState::Failed {
                reason: e.to_string(),
            }
        }
    };
    shared.finish(id, next);
}

async fn drive(
    shared: &Shared,
    id: u64,
    commands: &mut watch::Receiver<Command>,
) -> AppResult<TaskState> {
    let mut task = shared.task(id)?;

    if task.has_started()
        && let Some(refresher) = shared.refresher.clone()
    {
        match refresher
            .refresh(&task.video, &task.part, &task.selection)
            .await
        {
            Ok(selection) => {
                shared.update_selection(id, selection.clone())?;
                task.selection = selection;
            }
            Err(e) => warn!("任务 #{} 刷新码流地址失败，继续使用原地址: {}", id, e),
        }
    }

    loop {
        let interrupt = match download_streams(shared, &task, commands).await {
            Ok(interrupt) => interrupt,
            Err(e) if e.is_transient() => {
                let Some(attempt) = shared.bump_retry(id)? else {
                    return Err(e);
                };
                let delay = shared
                    .config
                    .retry_backoff
                    .saturating_mul(2u32.saturating_pow(attempt - 1));
                warn!(
                    "任务 #{} 下载中断 ({})，{:?} 后进行第 {} 次重试",
                    id, e, delay, attempt
                );
                match sleep_or_interrupt(delay, commands).await {
                    None => {
                        task = shared.task(id)?;
                        continue;
                    }
                    interrupt => interrupt,
                }
            }
            Err(e) => return Err(e),
        };
        match interrupt {
            None => break,
            Some(Interrupt::Pause) => return Ok(TaskState::Paused),
            Some(Interrupt::Cancel) => {
                remove_files(&task.all_files()).await;
                return Ok(TaskState::Cancelled);
            }
        }
    }

    // 下载完成与暂停同时发生时，以暂停为准，继续后直接进入合并
    match shared.enter_merging(id, commands)? {
        Some(Interrupt::Pause) => Ok(TaskState::Paused),
        Some(Interrupt::Cancel) => {
            remove_files(&task.all_files()).await;
            Ok(TaskState::Cancelled)
        }
        None => merge(shared, &shared.task(id)?, commands).await,
    }
}

/// 下载所有未完成的码流。返回 `Some` 表示被暂停或取消打断。
async fn download_streams(
    shared: &Shared,
    task: &DownloadTask,
    commands: &mut watch::Receiver<Command>,
) -> AppResult<Option<Interrupt>> {
    if let Some(interrupt) = pending_interrupt(commands) {
        return Ok(Some(interrupt));
    }
    let config = &shared.config;

    let mut active: Vec<(usize, Box<dyn Transfer>)> = Vec::new();
    for (idx, stream) in task.streams.iter().enumerate() {
        if stream.is_complete() {
            continue;
        }
        let descriptor = [&task.selection.video, &task.selection.audio]
            .into_iter()
            .flatten()
            .find(|d| d.kind == stream.kind)
            .ok_or_else(|| AppError::DownloadFailed {
                reason: format!("缺少 {:?} 码流的下载地址", stream.kind),
                transient: false,
            });
        let request = match descriptor {
            Ok(d) => TransferRequest {
                urls: d.urls.clone(),
                destination: stream.path.clone(),
                connections: config.connections,
                offset: stream.completed,
            },
            Err(e) => {
                terminate_all(&mut active).await;
                return Err(e);
            }
        };
        match shared.engine.start(&request).await {
            Ok(transfer) => active.push((idx, transfer)),
            Err(e) => {
                terminate_all(&mut active).await;
                return Err(e);
            }
        }
    }
    if active.is_empty() {
        return Ok(None);
    }
    debug!("任务 #{} 启动了 {} 个下载进程", task.id, active.len());

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_sample = (Instant::now(), task.completed_bytes());

    while !active.is_empty() {
        tokio::select! {
            _ = ticker.tick() => {}
            interrupt = next_interrupt(commands) => {
                if let Some(interrupt) = interrupt {
                    terminate_all(&mut active).await;
                    return Ok(Some(interrupt));
                }
                continue;
            }
        }

        let mut updates = Vec::new();
        let mut finished = Vec::new();
        let mut failure = None;
        for (pos, (idx, transfer)) in active.iter_mut().enumerate() {
            match transfer.poll().await {
                Ok(TransferStatus::Running { completed, total }) => {
                    updates.push((*idx, completed, total))
                }
                Ok(TransferStatus::Finished { total }) => {
                    updates.push((*idx, total, total));
                    finished.push(pos);
                }
                Ok(TransferStatus::Failed { reason, transient }) => {
                    failure = Some(AppError::DownloadFailed { reason, transient });
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        for pos in finished.into_iter().rev() {
            active.remove(pos);
        }

        let (completed, total) = shared.apply_progress(task.id, &updates)?;
        let elapsed = last_sample.0.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            (completed.saturating_sub(last_sample.1) as f64 / elapsed) as u64
        } else {
            0
        };
        last_sample = (Instant::now(), completed);
        shared.publish_progress(task.id, completed, total, speed);

        if let Some(e) = failure {
            terminate_all(&mut active).await;
            return Err(e);
        }
    }
    Ok(None)
}

async fn merge(
    shared: &Shared,
    task: &DownloadTask,
    commands: &mut watch::Receiver<Command>,
) -> AppResult<TaskState> {
    let request = MuxRequest {
        inputs: task.streams.iter().map(|s| s.path.clone()).collect(),
        output: task.output_path.clone(),
        mode: task.mode,
        audio_format: task.audio_format,
    };
    let mut process = shared.muxer.start(&request).await?;

    // 合并阶段只响应取消
    let result = loop {
        tokio::select! {
            result = process.wait() => break Some(result),
            interrupt = next_interrupt(commands) => {
                if interrupt == Some(Interrupt::Cancel) {
                    break None;
                }
            }
        }
    };

    match result {
        None => {
            process.terminate().await?;
            remove_files(&task.all_files()).await;
            Ok(TaskState::Cancelled)
        }
        // 此后到达的取消由 `Shared::finish` 处理
        Some(Ok(())) => {
            remove_files(&task.intermediate_files()).await;
            info!("任务 #{} 完成: {}", task.id, task.output_path.display());
            Ok(TaskState::Completed)
        }
        // 合并失败时保留中间文件以便排查
        Some(Err(e)) => Err(e),
    }
}

async fn sleep_or_interrupt(
    delay: Duration,
    commands: &mut watch::Receiver<Command>,
) -> Option<Interrupt> {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return None,
            interrupt = next_interrupt(commands) => {
                if interrupt.is_some() {
                    return interrupt;
                }
            }
        }
    }
}

async fn terminate_all(active: &mut Vec<(usize, Box<dyn Transfer>)>) {
    for (_, transfer) in active.iter_mut() {
        if let Err(e) = transfer.terminate().await {
            warn!("结束下载进程失败: {}", e);
        }
    }
    active.clear();
}

async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("已删除 {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("删除 {} 失败: {}", path.display(), e),
        }
    }
}
