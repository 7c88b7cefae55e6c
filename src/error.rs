// src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("无法识别的视频链接或编号: {0}")]
    InvalidReference(String),
    #[error("API 返回错误 (code={code}): {message}")]
    Api { code: i64, message: String },
    #[error("网络请求失败: {0}")]
    Network(#[from] reqwest::Error),
    #[error("网络中间件错误: {0}")]
    NetworkMiddleware(#[from] reqwest_middleware::Error),
    #[error("WBI 签名被服务器拒绝")]
    SignatureRejected,
    #[error("登录会话已过期，请重新登录")]
    SessionExpired,
    #[error("画质 {requested} 不可用: {reason}")]
    QualityUnavailable { requested: u32, reason: String },
    #[error("下载失败: {reason}")]
    DownloadFailed { reason: String, transient: bool },
    #[error("音视频合并失败: {0}")]
    MergeFailed(String),
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("临时文件持久化失败: {0}")]
    TempFilePersist(#[from] tempfile::PersistError),
    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),
    #[error("无法解析来自 '{url}' 的API响应: {source}")]
    ApiParseFailed {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("URL 解析错误: {0}")]
    Url(#[from] url::ParseError),
    #[error("任务 #{0} 不存在")]
    TaskNotFound(u64),
    #[error("{0}")]
    InvalidOperation(String),
    #[error("用户中断")]
    UserInterrupt,
    #[error("未知错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// 网络层的瞬时错误（超时、连接被重置等），可以退避后重试。
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            AppError::NetworkMiddleware(reqwest_middleware::Error::Reqwest(e)) => {
                e.is_timeout() || e.is_connect() || e.is_request()
            }
            AppError::NetworkMiddleware(_) => true,
            AppError::DownloadFailed { transient, .. } => *transient,
            _ => false,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
