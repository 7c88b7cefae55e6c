// src/config/credentials.rs

use crate::{
    config::ExternalConfig, // 只需要从父模块导入结构体定义
    constants,
    error::{AppError, AppResult},
    session::Session,
};
use anyhow::{Context, anyhow};
use chrono::Utc;
use log::{debug, info};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub(super) fn get_config_path() -> AppResult<PathBuf> {
    let path = dirs::home_dir()
        .ok_or_else(|| AppError::Other(anyhow!("无法获取用户主目录")))?
        .join(constants::CONFIG_DIR_NAME)
        .join(constants::CONFIG_FILE_NAME);
    Ok(path)
}

pub(crate) fn load_or_create_external_config() -> AppResult<ExternalConfig> {
    let config_path = get_config_path()?;
    if config_path.is_file() {
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("读取配置文件 '{}' 失败", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件 '{}' 失败", config_path.display()))
            .map_err(AppError::from)
    } else {
        info!("配置文件 {:?} 不存在，将创建默认配置。", config_path);
        let config = ExternalConfig::default_app_config();
        write_config(&config_path, &config)?;
        Ok(config)
    }
}

fn write_config(config_path: &Path, config: &ExternalConfig) -> AppResult<()> {
    if let Some(dir) = config_path.parent() {
        fs::create_dir_all(dir)?;
    }
    let json_content = serde_json::to_string_pretty(config)?;
    fs::write(config_path, json_content)
        .with_context(|| format!("写入配置文件 '{}' 失败", config_path.display()))?;
    Ok(())
}

pub fn save_session(session: &Session) -> AppResult<()> {
    let config_path = get_config_path()?;
    let mut config = load_or_create_external_config()?;
    config.session = Some(session.clone());
    write_config(&config_path, &config)?;

    info!(
        "登录会话已保存至配置文件: {} (有效期至 {})",
        config_path.display(),
        session.expires_at
    );
    Ok(())
}

pub fn clear_session() -> AppResult<()> {
    let config_path = get_config_path()?;
    let mut config = load_or_create_external_config()?;
    if config.session.take().is_some() {
        write_config(&config_path, &config)?;
        info!("已从配置文件中移除登录会话");
    }
    Ok(())
}

pub fn load_session_from_config() -> Option<Session> {
    load_or_create_external_config()
        .ok()
        .and_then(|config| config.session)
}

/// 按优先级查找会话: 命令行参数 > 环境变量 > 本地配置文件。
/// 手动提供的 Cookie 不带过期时间，按默认有效期处理。
pub fn resolve_session(cli_cookie: Option<&str>) -> (Option<Session>, String) {
    if let Some(cookie) = cli_cookie && !cookie.trim().is_empty() {
        debug!("使用来自命令行参数的 Cookie");
        return (
            Some(Session::with_default_ttl(cookie.trim(), Utc::now())),
            "命令行参数".to_string(),
        );
    }
    if let Ok(cookie) = std::env::var(constants::COOKIE_ENV_VAR) && !cookie.trim().is_empty() {
        debug!("使用来自环境变量 {} 的 Cookie", constants::COOKIE_ENV_VAR);
        return (
            Some(Session::with_default_ttl(cookie.trim(), Utc::now())),
            format!("环境变量 ({})", constants::COOKIE_ENV_VAR),
        );
    }
    if let Some(session) = load_session_from_config() {
        debug!("使用来自本地配置文件的会话");
        return (Some(session), "本地配置文件".to_string());
    }
    debug!("未在任何位置找到可用的会话");
    (None, "未找到".to_string())
}
