// src/lib.rs

pub mod api;
pub mod catalog;
pub mod cli;
pub mod client;
pub mod config;
pub mod constants;
pub mod downloader;
pub mod error;
pub mod models;
pub mod resolver;
pub mod session;
pub mod symbols;
pub mod ui;
pub mod utils;
mod workflows;

use crate::{
    api::{ApiStreamRefresher, BiliApi},
    cli::Cli,
    client::RobustClient,
    config::{AppConfig, credentials},
    downloader::{Aria2Engine, FfmpegMuxer, QueueScheduler, StreamRefresh},
    error::AppResult,
    resolver::IdentifierResolver,
    session::SessionManager,
};
use colored::*;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 核心的执行上下文，包含所有任务所需的状态和工具
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub api: Arc<BiliApi>,
    pub sessions: Arc<SessionManager>,
    pub resolver: Arc<IdentifierResolver>,
    pub scheduler: QueueScheduler,
    pub args: Arc<Cli>,
    pub cancellation_token: CancellationToken,
}

impl AppContext {
    pub fn new(
        args: Arc<Cli>,
        config: Arc<AppConfig>,
        cancellation_token: CancellationToken,
    ) -> AppResult<Self> {
        let client = Arc::new(RobustClient::new(config.clone())?);
        let api = Arc::new(BiliApi::new(client.clone())?);
        let sessions = Arc::new(SessionManager::new(api.clone(), config.qr_poll_interval));
        let resolver = Arc::new(IdentifierResolver::new(client));
        let refresher: Arc<dyn StreamRefresh> =
            Arc::new(ApiStreamRefresher::new(api.clone(), sessions.clone()));
        let scheduler = QueueScheduler::new(
            config.engine.clone(),
            Arc::new(Aria2Engine::new(config.engine.aria2c_path.clone())),
            Arc::new(FfmpegMuxer::new(config.engine.ffmpeg_path.clone())),
            Some(refresher),
        );
        Ok(Self {
            config,
            api,
            sessions,
            resolver,
            scheduler,
            args,
            cancellation_token,
        })
    }

    pub fn non_interactive(&self) -> bool {
        !self.args.interactive
    }
}

/// 库的公共入口点，由 `main.rs` 调用
pub async fn run_from_cli(args: Arc<Cli>, cancellation_token: CancellationToken) -> AppResult<()> {
    debug!("CLI 参数: {:?}", args);
    if args.login_help {
        ui::box_message(
            "登录与 Cookie 说明",
            constants::HELP_LOGIN_GUIDE
                .lines()
                .collect::<Vec<_>>()
                .as_slice(),
            |s| s.cyan(),
        );
        println!(
            "\n{} 安全提醒: Cookie 等同于账号凭据，请不要分享给他人。",
            *symbols::INFO
        );
        return Ok(());
    }

    if args.logout {
        credentials::clear_session()?;
        ui::ok("已退出登录，本地保存的会话已删除。");
        return Ok(());
    }

    let config = Arc::new(AppConfig::new(&args)?);
    debug!("加载的应用配置: {:?}", config);
    let context = AppContext::new(args.clone(), config, cancellation_token)?;

    let (session, source) = credentials::resolve_session(args.cookie.as_deref());
    if let Some(session) = session {
        if context.sessions.restore(session) {
            info!("从 {} 加载登录会话", source);
            ui::info(&format!("已从 {} 加载登录会话。", source));
        } else {
            warn!("来自 {} 的会话已过期", source);
            ui::warn(&format!("来自 {} 的会话已过期，将以未登录状态继续。", source));
        }
    } else {
        info!("未找到登录会话");
        ui::info("未登录，最高可下载 1080P 画质。使用 --login 扫码登录。");
    }

    if args.login {
        return workflows::run_login(&context).await;
    }

    workflows::verify_session(&context).await;
    workflows::prepare_queue(&context)?;

    if args.interactive {
        workflows::run_interactive(&context).await
    } else if let Some(batch_file) = &args.batch_file {
        workflows::run_batch(batch_file, &context).await
    } else if let Some(url) = &args.url {
        workflows::run_single(url, &context).await
    } else {
        workflows::run_resume(&context).await
    }
}
