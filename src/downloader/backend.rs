// src/downloader/backend.rs

//! 外部下载引擎 (aria2c) 与合并器 (ffmpeg) 的进程封装。

use crate::{
    constants,
    error::*,
    models::{AudioFormat, DownloadMode},
};
use async_trait::async_trait;
use log::{debug, warn};
use regex::Regex;
use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, LazyLock, Mutex},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
};

static ARIA2_READOUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[#\w+\s+([\d.]+)([KMGT]i)?B/([\d.]+)([KMGT]i)?B(?:\(\d+%\))?(?:.*?DL:([\d.]+)([KMGT]i)?B)?",
    )
    .unwrap()
});

/// 启动一个码流下载所需的参数。
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// 主地址在前，其余为镜像
    pub urls: Vec<String>,
    pub destination: PathBuf,
    pub connections: u32,
    /// 续传时已落盘的字节数
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Running { completed: u64, total: u64 },
    Finished { total: u64 },
    Failed { reason: String, transient: bool },
}

/// 正在运行的一次码流下载。句柄被丢弃时进程随之结束。
#[async_trait]
pub trait Transfer: Send {
    /// 读取当前状态，不会阻塞等待进程退出
    async fn poll(&mut self) -> AppResult<TransferStatus>;
    /// 结束进程并等待其退出，已下载的部分文件保留
    async fn terminate(&mut self) -> AppResult<()>;
}

#[async_trait]
pub trait DownloadEngine: Send + Sync {
    async fn start(&self, request: &TransferRequest) -> AppResult<Box<dyn Transfer>>;
}

#[derive(Debug, Clone)]
pub struct MuxRequest {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub mode: DownloadMode,
    pub audio_format: AudioFormat,
}

#[async_trait]
pub trait MuxProcess: Send {
    /// 等待合并结束，失败时返回 `MergeFailed`
    async fn wait(&mut self) -> AppResult<()>;
    async fn terminate(&mut self) -> AppResult<()>;
}

#[async_trait]
pub trait Muxer: Send + Sync {
    async fn start(&self, request: &MuxRequest) -> AppResult<Box<dyn MuxProcess>>;
}

// --- aria2c ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aria2Readout {
    pub completed: u64,
    pub total: u64,
    pub speed: u64,
}

fn scale(value: &str, unit: Option<&str>) -> u64 {
    let value: f64 = value.parse().unwrap_or(0.0);
    let factor = match unit {
        Some("Ki") => 1024f64,
        Some("Mi") => 1024f64.powi(2),
        Some("Gi") => 1024f64.powi(3),
        Some("Ti") => 1024f64.powi(4),
        _ => 1.0,
    };
    (value * factor) as u64
}

/// 解析 aria2c 控制台读数，例如 `[#2089b0 1.2MiB/10MiB(12%) CN:16 DL:3.4MiB ETA:2s]`
pub fn parse_aria2_readout(line: &str) -> Option<Aria2Readout> {
    let caps = ARIA2_READOUT_RE.captures(line)?;
    let completed = scale(&caps[1], caps.get(2).map(|m| m.as_str()));
    let total = scale(&caps[3], caps.get(4).map(|m| m.as_str()));
    let speed = caps
        .get(5)
        .map(|m| scale(m.as_str(), caps.get(6).map(|u| u.as_str())))
        .unwrap_or(0);
    Some(Aria2Readout {
        completed,
        total,
        speed,
    })
}

/// 根据 aria2c 的退出码判断失败是否值得重试。
pub fn classify_aria2_exit(code: Option<i32>) -> TransferStatus {
    let (reason, transient) = match code {
        Some(2) => ("连接超时".to_string(), true),
        Some(6) => ("网络错误".to_string(), true),
        Some(19) => ("域名解析失败".to_string(), true),
        Some(22) => ("HTTP 响应头异常".to_string(), true),
        Some(29) => ("服务器繁忙".to_string(), true),
        Some(3) => ("资源不存在 (链接可能已过期)".to_string(), false),
        Some(9) => ("磁盘空间不足".to_string(), false),
        Some(16) | Some(17) => ("无法创建或写入目标文件".to_string(), false),
        Some(24) => ("服务器拒绝访问".to_string(), false),
        Some(code) => (format!("aria2c 异常退出 (退出码 {})", code), false),
        // 被信号终止，通常是外部干预，可以再试
        None => ("aria2c 被终止".to_string(), true),
    };
    TransferStatus::Failed { reason, transient }
}

fn aria2_args(request: &TransferRequest) -> Vec<OsString> {
    let dir = request
        .destination
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = request
        .destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    let connections = request.connections.max(1);

    let mut args: Vec<OsString> = request.urls.iter().map(OsString::from).collect();
    args.push("--dir".into());
    args.push(dir.into_os_string());
    args.push("--out".into());
    args.push(name);
    for flag in [
        "--continue=true".to_string(),
        format!("--max-connection-per-server={}", connections),
        format!("--split={}", connections),
        "--min-split-size=1M".to_string(),
        "--summary-interval=1".to_string(),
        "--auto-file-renaming=false".to_string(),
        "--allow-overwrite=true".to_string(),
        "--console-log-level=warn".to_string(),
        "--header".to_string(),
        format!("Referer: {}", constants::REFERER),
        "--header".to_string(),
        format!("User-Agent: {}", constants::USER_AGENT),
    ] {
        args.push(flag.into());
    }
    args
}

fn spawn_error(tool: &Path, e: std::io::Error) -> AppError {
    if e.kind() == ErrorKind::NotFound {
        AppError::DownloadFailed {
            reason: format!("找不到外部程序 '{}'，请确认已安装并在 PATH 中", tool.display()),
            transient: false,
        }
    } else {
        AppError::Io(e)
    }
}

pub struct Aria2Engine {
    path: PathBuf,
}

impl Aria2Engine {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl DownloadEngine for Aria2Engine {
    async fn start(&self, request: &TransferRequest) -> AppResult<Box<dyn Transfer>> {
        if let Some(dir) = request.destination.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        debug!(
            "启动 aria2c: {} (续传偏移 {} 字节)",
            request.destination.display(),
            request.offset
        );
        let mut child = Command::new(&self.path)
            .args(aria2_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.path, e))?;

        let latest = Arc::new(Mutex::new(None));
        let reader = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(pump_readout(stdout, latest.clone())));

        Ok(Box::new(Aria2Transfer {
            child,
            destination: request.destination.clone(),
            latest,
            reader,
            offset: request.offset,
        }))
    }
}

/// 控制台读数以 `\r` 或 `\n` 分隔，只保留最后一条
async fn pump_readout<R: AsyncRead + Unpin>(mut reader: R, latest: Arc<Mutex<Option<Aria2Readout>>>) {
    let mut buf = [0u8; 4096];
    let mut line = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if let Some(readout) = parse_aria2_readout(&String::from_utf8_lossy(&line)) {
                    *latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(readout);
                }
                line.clear();
            } else {
                line.push(byte);
            }
        }
    }
}

struct Aria2Transfer {
    child: Child,
    destination: PathBuf,
    latest: Arc<Mutex<Option<Aria2Readout>>>,
    reader: Option<JoinHandle<()>>,
    offset: u64,
}

impl Aria2Transfer {
    fn latest(&self) -> Option<Aria2Readout> {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transfer for Aria2Transfer {
    async fn poll(&mut self) -> AppResult<TransferStatus> {
        match self.child.try_wait()? {
            None => {
                let readout = self.latest();
                Ok(TransferStatus::Running {
                    completed: readout.map_or(self.offset, |r| r.completed.max(self.offset)),
                    total: readout.map_or(0, |r| r.total),
                })
            }
            Some(status) if status.success() => {
                if let Some(reader) = self.reader.take() {
                    let _ = reader.await;
                }
                let total = match tokio::fs::metadata(&self.destination).await {
                    Ok(meta) => meta.len(),
                    Err(_) => self.latest().map_or(0, |r| r.total),
                };
                Ok(TransferStatus::Finished { total })
            }
            Some(status) => {
                warn!("aria2c 退出: {} ({})", status, self.destination.display());
                Ok(classify_aria2_exit(status.code()))
            }
        }
    }

    async fn terminate(&mut self) -> AppResult<()> {
        if self.child.try_wait()?.is_none() {
            debug!("终止 aria2c: {}", self.destination.display());
            self.child.start_kill()?;
            self.child.wait().await?;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        Ok(())
    }
}

// --- ffmpeg ---

pub fn ffmpeg_args(request: &MuxRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-y", "-hide_banner", "-loglevel", "error"]
        .map(OsString::from)
        .to_vec();
    for input in &request.inputs {
        args.push("-i".into());
        args.push(input.clone().into_os_string());
    }
    match (request.mode, request.audio_format) {
        (DownloadMode::VideoWithAudio, _) => {
            args.extend(["-c", "copy"].map(OsString::from));
        }
        (DownloadMode::AudioOnly, AudioFormat::Mp3) => {
            args.extend(["-vn", "-acodec", "libmp3lame", "-ab", "320k"].map(OsString::from));
        }
        (DownloadMode::AudioOnly, AudioFormat::M4a) => {
            args.extend(["-vn", "-c", "copy"].map(OsString::from));
        }
    }
    args.push(request.output.clone().into_os_string());
    args
}

pub struct FfmpegMuxer {
    path: PathBuf,
}

impl FfmpegMuxer {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn start(&self, request: &MuxRequest) -> AppResult<Box<dyn MuxProcess>> {
        debug!("启动 ffmpeg: {}", request.output.display());
        let mut child = Command::new(&self.path)
            .args(ffmpeg_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match spawn_error(&self.path, e) {
                AppError::DownloadFailed { reason, .. } => AppError::MergeFailed(reason),
                other => other,
            })?;
        let stderr = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });
        Ok(Box::new(FfmpegProcess { child, stderr }))
    }
}

struct FfmpegProcess {
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

impl FfmpegProcess {
    async fn failure_reason(&mut self, status: ExitStatus) -> String {
        let detail = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        match detail.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(last) => format!("ffmpeg 退出 ({}): {}", status, last.trim()),
            None => format!("ffmpeg 退出 ({})", status),
        }
    }
}

#[async_trait]
impl MuxProcess for FfmpegProcess {
    async fn wait(&mut self) -> AppResult<()> {
        let status = self.child.wait().await?;
        if status.success() {
            return Ok(());
        }
        Err(AppError::MergeFailed(self.failure_reason(status).await))
    }

    async fn terminate(&mut self) -> AppResult<()> {
        if self.child.try_wait()?.is_none() {
            debug!("终止 ffmpeg");
            self.child.start_kill()?;
            self.child.wait().await?;
        }
        if let Some(handle) = self.stderr.take() {
            handle.abort();
        }
        Ok(())
    }
}
