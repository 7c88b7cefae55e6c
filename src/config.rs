// src/config.rs

pub mod credentials;

use self::credentials::load_or_create_external_config;
use crate::{
    cli::Cli,
    constants,
    error::AppResult,
    models::{AudioFormat, FallbackPolicy},
    session::Session,
    utils,
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    pub connect_timeout_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub api_base: Option<String>,
    pub passport_base: Option<String>,
    pub short_link_hosts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DownloadSection {
    pub directory: Option<PathBuf>,
    pub max_concurrent: Option<usize>,
    pub connections: Option<u32>,
    pub max_retries: Option<u32>,
    pub fallback: Option<FallbackPolicy>,
    pub audio_format: Option<AudioFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    pub aria2c: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub download: DownloadSection,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

impl ExternalConfig {
    pub(crate) fn default_app_config() -> Self {
        // 为 NetworkConfig 提供一组稳健的默认值
        let network = NetworkConfig {
            connect_timeout_secs: Some(10),
            timeout_secs: Some(30),
            max_retries: Some(3),
            api_base: Some(constants::api::API_BASE.into()),
            passport_base: Some(constants::api::PASSPORT_BASE.into()),
            short_link_hosts: Some(
                constants::SHORT_LINK_HOSTS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
        };
        let download = DownloadSection {
            directory: None,
            max_concurrent: Some(constants::DEFAULT_MAX_CONCURRENT),
            connections: Some(constants::DEFAULT_CONNECTIONS),
            max_retries: Some(constants::DEFAULT_TASK_RETRIES),
            fallback: Some(FallbackPolicy::Strict),
            audio_format: Some(AudioFormat::Mp3),
        };

        Self {
            network,
            download,
            tools: ToolsConfig::default(),
            session: None,
        }
    }
}

/// 调度器与任务引擎在构造时拿到的配置，不读取任何全局状态。
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub download_dir: PathBuf,
    pub max_concurrent: usize,
    /// 每个码流的连接数 (传给下载引擎)
    pub connections: u32,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub fallback_policy: FallbackPolicy,
    pub audio_format: AudioFormat,
    pub aria2c_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    /// 为 `true` 时把队列写入 `download_dir/queue.json`
    pub persist_queue: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from(constants::DEFAULT_SAVE_DIR),
            max_concurrent: constants::DEFAULT_MAX_CONCURRENT,
            connections: constants::DEFAULT_CONNECTIONS,
            poll_interval: constants::PROGRESS_POLL_INTERVAL,
            max_retries: constants::DEFAULT_TASK_RETRIES,
            retry_backoff: constants::RETRY_BACKOFF_BASE,
            fallback_policy: FallbackPolicy::Strict,
            audio_format: AudioFormat::Mp3,
            aria2c_path: utils::find_tool("aria2c"),
            ffmpeg_path: utils::find_tool("ffmpeg"),
            persist_queue: false,
        }
    }
}

impl EngineConfig {
    pub fn queue_file(&self) -> PathBuf {
        self.download_dir.join(constants::QUEUE_FILE_NAME)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
    pub api_base: String,
    pub passport_base: String,
    pub short_link_hosts: Vec<String>,
    pub wbi_key_ttl: Duration,
    pub qr_poll_interval: Duration,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn new(args: &Cli) -> AppResult<Self> {
        let external_config = load_or_create_external_config()?;
        let network = external_config.network;
        let download = external_config.download;
        let tools = external_config.tools;

        let engine = EngineConfig {
            download_dir: args
                .output
                .clone()
                .or(download.directory)
                .unwrap_or_else(|| PathBuf::from(constants::DEFAULT_SAVE_DIR)),
            max_concurrent: args
                .workers
                .or(download.max_concurrent)
                .unwrap_or(constants::DEFAULT_MAX_CONCURRENT)
                .max(1),
            connections: args
                .threads
                .or(download.connections)
                .unwrap_or(constants::DEFAULT_CONNECTIONS)
                .clamp(1, 16),
            poll_interval: constants::PROGRESS_POLL_INTERVAL,
            max_retries: download.max_retries.unwrap_or(constants::DEFAULT_TASK_RETRIES),
            retry_backoff: constants::RETRY_BACKOFF_BASE,
            fallback_policy: args
                .fallback
                .or(download.fallback)
                .unwrap_or_default(),
            audio_format: args
                .audio_format
                .or(download.audio_format)
                .unwrap_or_default(),
            aria2c_path: tools.aria2c.unwrap_or_else(|| utils::find_tool("aria2c")),
            ffmpeg_path: tools.ffmpeg.unwrap_or_else(|| utils::find_tool("ffmpeg")),
            persist_queue: true,
        };

        Ok(Self {
            user_agent: constants::USER_AGENT.into(),
            connect_timeout: Duration::from_secs(network.connect_timeout_secs.unwrap_or(10)),
            timeout: Duration::from_secs(network.timeout_secs.unwrap_or(30)),
            max_retries: network.max_retries.unwrap_or(3),
            api_base: network
                .api_base
                .unwrap_or_else(|| constants::api::API_BASE.into()),
            passport_base: network
                .passport_base
                .unwrap_or_else(|| constants::api::PASSPORT_BASE.into()),
            short_link_hosts: network.short_link_hosts.unwrap_or_else(|| {
                constants::SHORT_LINK_HOSTS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            }),
            wbi_key_ttl: constants::WBI_KEY_TTL,
            qr_poll_interval: constants::QR_POLL_INTERVAL,
            engine,
        })
    }
}

#[cfg(feature = "testing")]
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            user_agent: "test-agent/1.0".to_string(),
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
            max_retries: 2,
            api_base: constants::api::API_BASE.to_string(),
            passport_base: constants::api::PASSPORT_BASE.to_string(),
            short_link_hosts: vec!["b23.tv".to_string()],
            wbi_key_ttl: constants::WBI_KEY_TTL,
            qr_poll_interval: Duration::from_millis(10),
            engine: EngineConfig::default(),
        }
    }
}

#[cfg(feature = "testing")]
impl AppConfig {
    /// 把所有接口地址指向同一个模拟服务器
    pub fn with_mock_server(server_url: &str) -> Self {
        Self {
            api_base: server_url.to_string(),
            passport_base: server_url.to_string(),
            ..Self::default()
        }
    }
}
