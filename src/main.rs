// src/main.rs

use bili_dl::{
    cli::{Cli, LogLevel},
    constants,
    error::AppError,
    run_from_cli, symbols,
};
use clap::{CommandFactory, FromArgMatches};
use colored::*;
use log::warn;
use std::{env, sync::Arc};
use tokio_util::sync::CancellationToken;

fn init_logger(level: LogLevel) {
    if level == LogLevel::Off {
        return;
    }

    let filter = match level {
        LogLevel::Off => log::LevelFilter::Off,
        LogLevel::Error => log::LevelFilter::Error,
        LogLevel::Warn => log::LevelFilter::Warn,
        LogLevel::Info => log::LevelFilter::Info,
        LogLevel::Debug => log::LevelFilter::Debug,
        LogLevel::Trace => log::LevelFilter::Trace,
    };

    let app_name = clap::crate_name!();

    let log_file_path = match dirs::home_dir() {
        Some(home) => home
            .join(constants::CONFIG_DIR_NAME)
            .join(constants::LOG_FILE_NAME),
        None => {
            eprintln!("警告: 无法获取用户主目录，日志将写入临时目录。");
            env::temp_dir().join(app_name).join(constants::LOG_FILE_NAME)
        }
    };

    if let Some(dir) = log_file_path.parent()
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!("警告: 无法创建日志目录 {:?}: {}", dir, e);
    }

    let file_appender = match fern::log_file(&log_file_path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!(
                "警告: 无法打开日志文件 {:?} : {}。将尝试使用备用日志文件。",
                log_file_path, e
            );
            let fallback_path = env::temp_dir().join(format!(
                "{}-{}",
                app_name,
                constants::LOG_FALLBACK_FILE_NAME
            ));
            match fern::log_file(&fallback_path) {
                Ok(file) => {
                    warn!("日志将写入备用文件: {:?}", fallback_path);
                    file
                }
                Err(e_fb) => {
                    eprintln!(
                        "错误: 无法创建备用日志文件 {:?}: {}。日志将不会被记录。",
                        fallback_path, e_fb
                    );
                    return;
                }
            }
        }
    };

    let result = fern::Dispatch::new()
        .level(filter)
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] [{:<5}] [{}:{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.line().unwrap_or(0),
                message
            ))
        })
        .chain(file_appender)
        .apply();

    if let Err(e) = result {
        eprintln!("警告: 日志系统初始化失败: {}", e);
    }
}

#[tokio::main]
async fn main() {
    #[cfg(windows)]
    {
        colored::control::set_virtual_terminal(true).ok();
    }

    let bin_name = env::var("CARGO_BIN_NAME").unwrap_or_else(|_| "bili-dl".to_string());
    let after_help = format!(
        "示例:\n  # 扫码登录\n  {bin} --login\n\n  # 下载单个视频的全部分P\n  {bin} --url \"https://www.bilibili.com/video/BV1xx411c7mD\"\n\n  # 指定 4K 画质，只下载第 1-3 P\n  {bin} --url BV1xx411c7mD -q 4k --select 1-3\n\n  # 只下载音频 (MP3)\n  {bin} --url https://b23.tv/xxxxxxx --audio-only\n\n  # 交互模式\n  {bin} -i\n\n  # 继续上次暂停的任务\n  {bin} --resume",
        bin = bin_name
    );
    let cmd = Cli::command().after_help(after_help);
    let args = match Cli::from_arg_matches(&cmd.get_matches()) {
        Ok(args) => Arc::new(args),
        Err(e) => e.exit(),
    };
    init_logger(args.log_level);

    // 第一次 Ctrl+C 暂停下载并保存进度，第二次直接退出
    let cancellation_token = CancellationToken::new();
    let token = cancellation_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        println!(
            "\n{} 正在暂停并保存进度... (再按一次 {} 强制退出)",
            *symbols::WARN,
            *symbols::CTRL_C
        );
        token.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{} 用户强制中断程序。", *symbols::WARN);
            std::process::exit(130);
        }
    });

    match run_from_cli(args, cancellation_token).await {
        Ok(()) => {}
        Err(AppError::UserInterrupt) => std::process::exit(130),
        Err(e) => {
            eprintln!("\n{} {}", *symbols::ERROR, format!("程序执行出错: {}", e).red());
            std::process::exit(1);
        }
    }
}
