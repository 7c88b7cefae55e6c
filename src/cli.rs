// src/cli.rs

use crate::{
    constants,
    models::{AudioFormat, DownloadMode, FallbackPolicy},
};
use clap::{Parser, ValueEnum, crate_version};
use std::path::PathBuf;

/// 定义日志输出级别
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Parser, Debug, Clone)]
#[command(
    version = crate_version!(),
    about,
    long_about = None,
    arg_required_else_help = true,
    disable_help_flag = true,
    disable_version_flag = true,
)]
#[command(group(
    clap::ArgGroup::new("run_mode")
        .required(true)
        .args(&["interactive", "url", "batch_file", "login", "logout", "resume", "login_help"]),
))]
pub struct Cli {
    // --- 运行模式 (Mode) ---
    /// 启动交互式会话，逐一输入链接或 BV 号
    #[arg(short, long, action = clap::ArgAction::SetTrue, help_heading = "Mode")]
    pub interactive: bool,
    /// 下载单个视频 (BV 号、视频链接、b23.tv 短链或分享文本)
    #[arg(long, help_heading = "Mode")]
    pub url: Option<String>,
    /// 从文本文件批量下载 (每行一个链接或 BV 号)
    #[arg(short, long, value_name = "FILE", help_heading = "Mode")]
    pub batch_file: Option<PathBuf>,
    /// 扫码登录并保存会话
    #[arg(long, action = clap::ArgAction::SetTrue, help_heading = "Mode")]
    pub login: bool,
    /// 退出登录并删除本地保存的会话
    #[arg(long, action = clap::ArgAction::SetTrue, help_heading = "Mode")]
    pub logout: bool,
    /// 继续下载目录中上次未完成的任务
    #[arg(long, action = clap::ArgAction::SetTrue, help_heading = "Mode")]
    pub resume: bool,
    /// 显示登录与 Cookie 的说明并退出
    #[arg(long, action = clap::ArgAction::SetTrue, help_heading = "Mode")]
    pub login_help: bool,

    // --- 下载选项 (Options) ---
    /// 画质: 档位数值 (80) 或写法 ('1080p', '4k', 'best')
    #[arg(short, long, default_value_t = constants::DEFAULT_QUALITY.to_string(), help_heading = "Options")]
    pub quality: String,
    /// 下载模式
    #[arg(long, value_enum, default_value_t = DownloadMode::VideoWithAudio, help_heading = "Options")]
    pub mode: DownloadMode,
    /// 仅下载音频，等同于 --mode audio-only
    #[arg(long, action = clap::ArgAction::SetTrue, help_heading = "Options")]
    pub audio_only: bool,
    /// 仅音频模式的输出格式
    #[arg(long, value_enum, help_heading = "Options")]
    pub audio_format: Option<AudioFormat>,
    /// 未登录时请求高画质的处理方式
    #[arg(long, value_enum, help_heading = "Options")]
    pub fallback: Option<FallbackPolicy>,
    /// 指定要下载的分P (例如 '1-5,8', 'all')
    #[arg(long, default_value_t = constants::DEFAULT_SELECTION.to_string(), value_name = "SELECTION", help_heading = "Options")]
    pub select: String,
    /// 提供 Cookie (SESSDATA=...)，优先级最高
    #[arg(long, help_heading = "Options")]
    pub cookie: Option<String>,
    /// 同时进行的下载任务数
    #[arg(short, long, value_parser = clap::value_parser!(usize), help_heading = "Options")]
    pub workers: Option<usize>,
    /// 每个码流的下载连接数 (1-16)
    #[arg(short, long, value_parser = clap::value_parser!(u32), help_heading = "Options")]
    pub threads: Option<u32>,
    /// 设置文件保存目录
    #[arg(short, long, value_name = "DIR", help_heading = "Options")]
    pub output: Option<PathBuf>,

    // --- 通用选项 (General) ---
    /// 显示此帮助信息并退出
    #[arg(short = 'h', long, action = clap::ArgAction::Help, global = true, help_heading = "General")]
    _help: Option<bool>,
    /// 显示版本信息并退出
    #[arg(short = 'V', long, action = clap::ArgAction::Version, global = true, help_heading = "General")]
    _version: Option<bool>,
    /// (隐藏参数) 设置日志文件的输出级别，用于调试
    #[arg(long, value_enum, default_value_t = LogLevel::Off, global = true, hide = true)]
    pub log_level: LogLevel,
}

impl Cli {
    pub fn download_mode(&self) -> DownloadMode {
        if self.audio_only {
            DownloadMode::AudioOnly
        } else {
            self.mode
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn audio_only_flag_overrides_mode() {
        let cli = Cli::try_parse_from(["bili-dl", "--url", "BV1xx411c7mD", "--audio-only"])
            .unwrap();
        assert_eq!(cli.download_mode(), DownloadMode::AudioOnly);
        assert_eq!(cli.quality, "80");
        assert_eq!(cli.select, "all");
    }

    #[test]
    fn modes_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["bili-dl", "--login", "--logout"]).is_err());
        assert!(Cli::try_parse_from(["bili-dl", "-q", "4k"]).is_err());

        let cli = Cli::try_parse_from(["bili-dl", "--login", "--mode", "audio-only"]).unwrap();
        assert!(cli.login);
        assert_eq!(cli.download_mode(), DownloadMode::AudioOnly);
    }
}
