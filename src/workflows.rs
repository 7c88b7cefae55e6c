// src/workflows.rs

use crate::{
    AppContext, catalog,
    config::credentials,
    constants,
    downloader::{DownloadTask, QueueScheduler, TaskEvent, TaskRequest, TaskState},
    error::{AppError, AppResult},
    models::{FallbackPolicy, QualityTier, StreamSelection, VideoId, VideoInfo, VideoPart},
    session::{LoginState, Session},
    symbols, ui, utils,
};
use anyhow::anyhow;
use chrono::{Local, Utc};
use colored::*;
use futures::{StreamExt, stream};
use indicatif::{HumanBytes, MultiProgress, ProgressBar};
use itertools::Itertools;
use log::{debug, error, info, warn};
use std::{collections::HashMap, future::Future, path::Path};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// 批量模式下同时解析的链接数
const BATCH_RESOLVE_CONCURRENCY: usize = 4;

// --- 登录 ---

/// 扫码登录。二维码过期后可以重新生成，或改为手动粘贴 Cookie。
pub(crate) async fn run_login(context: &AppContext) -> AppResult<()> {
    ui::print_header("扫码登录");
    loop {
        let ticket = context.sessions.start_login().await?;
        match ui::render_qr(&ticket.url) {
            Ok(qr) => {
                ui::box_message(
                    "请使用哔哩哔哩手机客户端扫描下方二维码",
                    &["扫码后请在手机上点击确认登录。"],
                    |s| s.cyan(),
                );
                ui::plain(&qr);
                ui::info(&format!("无法扫码时可在手机上打开: {}", ticket.url));
            }
            Err(e) => {
                warn!("{}", e);
                ui::box_message(
                    "请将下面的链接生成二维码，并用哔哩哔哩手机客户端扫码",
                    &[ticket.url.as_str(), "", "扫码后请在手机上点击确认登录。"],
                    |s| s.cyan(),
                );
            }
        }
        ui::info(&format!("等待扫码中... (按 {} 取消)", *symbols::CTRL_C));

        match context
            .sessions
            .wait_for_login(&context.cancellation_token)
            .await?
        {
            LoginState::Confirmed => break,
            LoginState::Expired => {
                ui::warn("二维码已过期。");
                if ui::confirm("是否重新生成二维码?", true) {
                    continue;
                }
                if ui::confirm("是否改为手动粘贴 Cookie?", false) {
                    return manual_cookie_login(context).await;
                }
                return Err(AppError::UserInterrupt);
            }
            _ => return Err(AppError::UserInterrupt),
        }
    }

    let session = context
        .sessions
        .current()
        .ok_or(AppError::SessionExpired)?;
    finish_login(context, &session).await
}

async fn manual_cookie_login(context: &AppContext) -> AppResult<()> {
    let cookie = ui::prompt_hidden("请粘贴 Cookie (输入内容不会显示)")?;
    if cookie.trim().is_empty() {
        return Err(AppError::UserInterrupt);
    }
    let session = Session::with_default_ttl(cookie.trim(), Utc::now());
    context.sessions.restore(session.clone());
    finish_login(context, &session).await
}

async fn finish_login(context: &AppContext, session: &Session) -> AppResult<()> {
    let user = match context.api.user_info(session).await {
        Ok(user) => user,
        Err(e) => {
            context.sessions.logout();
            return Err(e);
        }
    };
    credentials::save_session(session)?;
    info!("登录用户: {} (UID {}, 大会员: {})", user.name, user.mid, user.is_vip);

    let user_line = format!("用户: {} (UID {})", user.name, user.mid);
    let vip_line = format!("大会员: {}", if user.is_vip { "是" } else { "否" });
    let expiry_line = format!(
        "会话有效期至: {}",
        session
            .expires_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M")
    );
    ui::box_message(
        "登录成功",
        &[user_line.as_str(), vip_line.as_str(), expiry_line.as_str()],
        |s| s.green(),
    );
    Ok(())
}

/// 启动时确认已加载的会话仍然有效
pub(crate) async fn verify_session(context: &AppContext) {
    let Some(session) = context.sessions.current() else {
        return;
    };
    match context.api.user_info(&session).await {
        Ok(user) => {
            let vip = if user.is_vip { " [大会员]" } else { "" };
            ui::info(&format!("当前用户: {}{}", user.name.bold(), vip));
        }
        Err(AppError::SessionExpired) => {
            context.sessions.logout();
            ui::warn("登录会话已失效，将以未登录状态继续。使用 --login 重新登录。");
        }
        Err(e) => warn!("获取用户信息失败，跳过会话校验: {}", e),
    }
}

/// 会话在请求过程中失效时: 交互模式询问是否重新登录，否则以未登录状态重试一次。
async fn with_session<T, F, Fut>(context: &AppContext, request: F) -> AppResult<T>
where
    F: Fn(Option<Session>) -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    match request(context.sessions.current()).await {
        Err(AppError::SessionExpired) => {
            context.sessions.logout();
            warn!("请求过程中登录会话失效");
            if !context.non_interactive()
                && ui::confirm("登录会话已失效，是否立即重新扫码登录?", true)
            {
                run_login(context).await?;
            } else {
                ui::warn("登录会话已失效，改为以未登录状态继续。");
            }
            request(context.sessions.current()).await
        }
        other => other,
    }
}

// --- 下载准备 ---

/// 创建下载目录并恢复上次保存的队列
pub(crate) fn prepare_queue(context: &AppContext) -> AppResult<()> {
    let dir = &context.config.engine.download_dir;
    std::fs::create_dir_all(dir)?;
    let display_dir = dunce::canonicalize(dir).unwrap_or_else(|_| dir.clone());
    ui::info(&format!("文件保存目录: {}", display_dir.display()));

    let restored = context.scheduler.restore()?;
    if restored > 0 {
        let snapshot = context.scheduler.snapshot();
        let unfinished = snapshot.iter().filter(|t| !t.state.is_terminal()).count();
        info!("恢复了 {} 个任务，其中 {} 个未完成", restored, unfinished);
        if unfinished > 0 {
            ui::info(&format!(
                "已恢复上次未完成的 {} 个任务 (暂停的任务可用 --resume 继续)。",
                unfinished
            ));
        }
    }
    Ok(())
}

fn requested_quality(context: &AppContext) -> AppResult<QualityTier> {
    QualityTier::parse(&context.args.quality).ok_or_else(|| {
        AppError::InvalidOperation(format!(
            "无法识别的画质 '{}'，可用写法: 80, 1080p, 4k, best",
            context.args.quality
        ))
    })
}

/// 解析输入并把选中的分P加入队列，返回新任务的编号
async fn enqueue_input(input: &str, context: &AppContext) -> AppResult<Vec<u64>> {
    let id = context.resolver.resolve(input).await?;
    enqueue_video(&id, context).await
}

async fn enqueue_video(id: &VideoId, context: &AppContext) -> AppResult<Vec<u64>> {
    let requested = requested_quality(context)?;
    let api = context.api.as_ref();
    let info = with_session(context, move |session| async move {
        api.video_info(id, session.as_ref()).await
    })
    .await?;
    print_video_summary(&info);

    let parts = choose_parts(context, &info);
    if parts.is_empty() {
        ui::warn("没有选中任何分P。");
        return Ok(vec![]);
    }

    let mode = context.args.download_mode();
    let mut policy = context.config.engine.fallback_policy;
    let mut ids = Vec::new();
    for part in parts {
        let selection = choose_streams(context, &info, part, requested, &mut policy).await?;
        let request = TaskRequest {
            video: info.id.clone(),
            title: info.title.clone(),
            part: part.clone(),
            part_count: info.parts.len(),
            mode,
            selection,
        };
        match context.scheduler.enqueue(request) {
            Ok(task_id) => ids.push(task_id),
            Err(AppError::InvalidOperation(msg)) => ui::warn(&format!("P{}: {}", part.index, msg)),
            Err(e) => return Err(e),
        }
    }
    Ok(ids)
}

fn print_video_summary(info: &VideoInfo) {
    ui::print_sub_header(&utils::truncate_text(&info.title, constants::UI_WIDTH - 10));
    ui::plain(&format!(
        "  {} | UP主: {} | 时长: {} | 分P: {}",
        info.id,
        info.owner,
        utils::format_duration(info.duration),
        info.parts.len()
    ));
}

fn choose_parts<'a>(context: &AppContext, info: &'a VideoInfo) -> Vec<&'a VideoPart> {
    if info.parts.len() <= 1 {
        return info.parts.iter().collect();
    }
    let indices = if context.non_interactive() {
        utils::parse_selection_indices(&context.args.select, info.parts.len())
    } else {
        let options: Vec<String> = info
            .parts
            .iter()
            .map(|p| {
                format!(
                    "P{} {} ({})",
                    p.index,
                    utils::truncate_text(&p.title, constants::FILENAME_TRUNCATE_LENGTH),
                    utils::format_duration(p.duration)
                )
            })
            .collect();
        ui::get_user_choices_from_menu(&options, "请选择要下载的分P", &context.args.select)
    };
    indices
        .into_iter()
        .filter_map(|i| info.parts.get(i))
        .collect()
}

/// 获取码流并按画质选择。未登录请求高画质时，交互模式下询问是否降级。
async fn choose_streams(
    context: &AppContext,
    info: &VideoInfo,
    part: &VideoPart,
    requested: QualityTier,
    policy: &mut FallbackPolicy,
) -> AppResult<StreamSelection> {
    let api = context.api.as_ref();
    let video = &info.id;
    let set = with_session(context, move |session| async move {
        api.streams(video, part, session.as_ref()).await
    })
    .await?;
    let has_session = context.sessions.current().is_some();
    let mode = context.args.download_mode();

    let selection = match catalog::select(&set, requested, has_session, *policy, mode) {
        Err(AppError::QualityUnavailable { requested, reason })
            if !context.non_interactive() && *policy == FallbackPolicy::Strict =>
        {
            ui::warn(&reason);
            let anonymous = set
                .accepted
                .iter()
                .filter(|t| !t.requires_session())
                .map(|t| t.label())
                .join(", ");
            ui::info(&format!("未登录可用的画质: {}", anonymous));
            if !ui::confirm("是否降级到未登录可用的最高画质?", true) {
                return Err(AppError::QualityUnavailable { requested, reason });
            }
            *policy = FallbackPolicy::Downgrade;
            catalog::select(&set, QualityTier(requested), has_session, *policy, mode)?
        }
        other => other?,
    };

    let described = selection
        .video
        .as_ref()
        .map(|v| format!("{} {}", v.tier.label(), v.codec))
        .unwrap_or_else(|| "仅音频".to_string());
    ui::info(&format!("P{}: {}", part.index, described));
    Ok(selection)
}

// --- 运行模式 ---

pub(crate) async fn run_single(input: &str, context: &AppContext) -> AppResult<()> {
    let ids = enqueue_input(input, context).await?;
    wait_for_tasks(context, &ids).await
}

pub(crate) async fn run_interactive(context: &AppContext) -> AppResult<()> {
    ui::print_header("交互模式");
    ui::plain(&format!(
        "在此模式下，你可以逐一输入 视频链接、BV 号或分享文本 进行下载。直接回车退出，下载中按 {} 可暂停。",
        *symbols::CTRL_C
    ));

    while !context.cancellation_token.is_cancelled() {
        match ui::prompt("请输入视频链接或 BV 号", None) {
            Ok(input) if !input.is_empty() => {
                let result = async {
                    let ids = enqueue_input(&input, context).await?;
                    wait_for_tasks(context, &ids).await
                }
                .await;
                match result {
                    Ok(()) => {}
                    Err(AppError::UserInterrupt) => break,
                    Err(e) => {
                        error!("交互模式任务 '{}' 失败: {}", input, e);
                        ui::error(&format!("处理任务时发生错误: {}", e));
                    }
                }
            }
            Ok(_) => break,
            Err(_) => return Err(AppError::UserInterrupt),
        }
    }

    ui::info("退出交互模式。");
    Ok(())
}

pub(crate) async fn run_batch(batch_file: &Path, context: &AppContext) -> AppResult<()> {
    let content = tokio::fs::read_to_string(batch_file).await.map_err(|e| {
        error!("读取批量文件 '{}' 失败: {}", batch_file.display(), e);
        AppError::from(e)
    })?;
    let inputs: Vec<String> = content
        .lines()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.starts_with('#'))
        .collect();
    if inputs.is_empty() {
        warn!("批量文件 '{}' 为空或不含有效行。", batch_file.display());
        ui::warn(&format!("批量文件 '{}' 为空。", batch_file.display()));
        return Ok(());
    }

    ui::print_header(&format!(
        "开始批量处理 {} 个条目 (按 {} 可随时暂停)",
        inputs.len(),
        *symbols::CTRL_C
    ));

    // 短链需要网络请求，先并发解析，结果保持输入顺序
    let resolved: Vec<(String, AppResult<VideoId>)> = stream::iter(inputs)
        .map(|input| {
            let resolver = context.resolver.clone();
            async move {
                let result = resolver.resolve(&input).await;
                (input, result)
            }
        })
        .buffered(BATCH_RESOLVE_CONCURRENCY)
        .collect()
        .await;

    let mut task_ids = Vec::new();
    let mut failed_inputs = 0;
    for (input, result) in resolved {
        if context.cancellation_token.is_cancelled() {
            return Err(AppError::UserInterrupt);
        }
        let outcome = match result {
            Ok(id) => enqueue_video(&id, context).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(ids) => task_ids.extend(ids),
            Err(e) => {
                failed_inputs += 1;
                error!("批量条目 '{}' 失败: {}", input, e);
                ui::error(&format!("{}: {}", utils::truncate_text(&input, 60), e));
            }
        }
    }

    let result = wait_for_tasks(context, &task_ids).await;
    if failed_inputs > 0 {
        ui::warn(&format!("{} 个条目未能加入队列。", failed_inputs));
    }
    result?;
    if failed_inputs > 0 {
        Err(AppError::Other(anyhow!("{} 个批量条目处理失败。", failed_inputs)))
    } else {
        Ok(())
    }
}

/// 继续暂停的任务并重新排队失败的任务
pub(crate) async fn run_resume(context: &AppContext) -> AppResult<()> {
    let scheduler = &context.scheduler;
    let mut pending = Vec::new();
    for task in scheduler.snapshot() {
        let result = match task.state {
            TaskState::Paused => scheduler.resume(task.id),
            TaskState::Failed { .. } => scheduler.retry(task.id),
            TaskState::Queued | TaskState::Downloading | TaskState::Merging => Ok(()),
            TaskState::Completed | TaskState::Cancelled => continue,
        };
        match result {
            Ok(()) => pending.push(task.id),
            Err(e) => warn!("无法继续任务 #{}: {}", task.id, e),
        }
    }
    if pending.is_empty() {
        ui::info("没有需要继续的任务。");
        return Ok(());
    }
    ui::info(&format!("继续 {} 个未完成的任务。", pending.len()));
    wait_for_tasks(context, &pending).await
}

// --- 等待与报告 ---

/// 显示进度直到任务全部结束。收到中断信号时暂停所有下载并保存进度。
async fn wait_for_tasks(context: &AppContext, ids: &[u64]) -> AppResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let scheduler = &context.scheduler;
    loop {
        let view = ProgressView::spawn(scheduler);
        let interrupted = tokio::select! {
            _ = scheduler.wait_until_settled() => false,
            _ = context.cancellation_token.cancelled() => true,
        };
        if interrupted {
            scheduler.pause_all().await;
            view.finish().await;
            ui::warn("下载已暂停，进度已保存。使用 --resume 继续未完成的任务。");
            return Err(AppError::UserInterrupt);
        }
        view.finish().await;

        let tasks: Vec<DownloadTask> = ids.iter().filter_map(|id| scheduler.task(*id)).collect();
        let failed = report(scheduler, &tasks);
        if failed.is_empty() {
            return Ok(());
        }
        if context.non_interactive() {
            return Err(AppError::Other(anyhow!(
                "{} 个任务下载失败，可使用 --resume 重试。",
                failed.len()
            )));
        }
        if ui::confirm("是否重试失败的任务?", true) {
            for id in &failed {
                scheduler.retry(*id)?;
            }
            continue;
        }
        if ui::confirm("是否删除失败任务已下载的部分文件?", false) {
            for id in &failed {
                scheduler.cancel(*id)?;
                scheduler.remove(*id)?;
            }
        }
        return Ok(());
    }
}

/// 打印结果并把已完成的任务移出队列，返回失败任务的编号
fn report(scheduler: &QueueScheduler, tasks: &[DownloadTask]) -> Vec<u64> {
    ui::print_header("下载报告");
    let mut completed = 0;
    let mut failed = Vec::new();
    for task in tasks {
        match &task.state {
            TaskState::Completed => {
                completed += 1;
                ui::ok(&task.output_path.display().to_string());
            }
            TaskState::Failed { reason } => {
                failed.push(task.id);
                ui::error(&format!("{}: {}", task.display_name(), reason));
            }
            TaskState::Cancelled => ui::warn(&format!("{}: 已取消", task.display_name())),
            other => ui::info(&format!("{}: {}", task.display_name(), other)),
        }
        if matches!(task.state, TaskState::Completed | TaskState::Cancelled)
            && let Err(e) = scheduler.remove(task.id)
        {
            debug!("移除任务 #{} 失败: {}", task.id, e);
        }
    }
    println!(
        "{} | {} | 总计: {}",
        format!("成功: {}", completed).green(),
        format!("失败: {}", failed.len()).red(),
        tasks.len()
    );
    failed
}

/// 订阅调度器事件并绘制进度条
struct ProgressView {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressView {
    fn spawn(scheduler: &QueueScheduler) -> Self {
        let stop = CancellationToken::new();
        // 先订阅再取快照，避免漏掉两者之间的事件
        let mut events = scheduler.subscribe();
        let scheduler = scheduler.clone();
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            let mut bars = ProgressBars::new(scheduler);
            bars.seed();
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => bars.apply(event),
                    Err(RecvError::Lagged(skipped)) => debug!("进度显示跳过了 {} 条事件", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
            while let Ok(event) = events.try_recv() {
                bars.apply(event);
            }
            bars.abandon_all();
        });
        Self { stop, handle }
    }

    async fn finish(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            warn!("进度显示任务异常退出: {}", e);
        }
    }
}

struct ProgressBars {
    scheduler: QueueScheduler,
    multi: MultiProgress,
    bars: HashMap<u64, ProgressBar>,
}

impl ProgressBars {
    fn new(scheduler: QueueScheduler) -> Self {
        Self {
            scheduler,
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn seed(&mut self) {
        for task in self.scheduler.snapshot() {
            if !task.state.is_terminal() {
                self.bar_for(task.id, &task.state);
            }
        }
    }

    /// 取得任务的进度条；已结束的进度条在任务重新开始时换成新的
    fn bar_for(&mut self, id: u64, state: &TaskState) -> Option<&ProgressBar> {
        let stale = self
            .bars
            .get(&id)
            .is_some_and(|bar| bar.is_finished() && !state.is_terminal());
        if stale || !self.bars.contains_key(&id) {
            let task = self.scheduler.task(id)?;
            let bar = ui::new_task_progress_bar(&self.multi, task.total_bytes(), &task.display_name());
            bar.set_position(task.completed_bytes());
            bar.set_message(task.state.to_string());
            self.bars.insert(id, bar);
        }
        self.bars.get(&id)
    }

    fn apply(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Added { id, .. } => {
                self.bar_for(id, &TaskState::Queued);
            }
            TaskEvent::StateChanged { id, state } => {
                let Some(bar) = self.bar_for(id, &state) else {
                    return;
                };
                match &state {
                    TaskState::Completed => {
                        bar.finish_with_message(format!("{} 完成", *symbols::OK))
                    }
                    TaskState::Failed { reason } => bar.abandon_with_message(format!(
                        "{} {}",
                        *symbols::ERROR,
                        utils::truncate_text(reason, 40)
                    )),
                    TaskState::Cancelled => {
                        bar.abandon_with_message(format!("{} 已取消", *symbols::WARN))
                    }
                    TaskState::Paused => bar.set_message(format!("{} {}", *symbols::PAUSED, state)),
                    other => bar.set_message(other.to_string()),
                }
            }
            TaskEvent::Progress {
                id,
                completed,
                total,
                speed,
            } => {
                let Some(bar) = self.bar_for(id, &TaskState::Downloading) else {
                    return;
                };
                if total > 0 {
                    bar.set_length(total);
                }
                bar.set_position(completed);
                bar.set_message(format!("{}/s", HumanBytes(speed)));
            }
            TaskEvent::Removed { id } => {
                self.bars.remove(&id);
            }
        }
    }

    fn abandon_all(&self) {
        for bar in self.bars.values().filter(|bar| !bar.is_finished()) {
            bar.abandon();
        }
    }
}
