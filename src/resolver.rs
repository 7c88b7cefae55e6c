// src/resolver.rs

//! 把用户输入 (BV 号、完整链接、短链接、分享文案) 统一解析为 `VideoId`。

use crate::{client::RobustClient, error::*, models::VideoId};
use log::{debug, info};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use url::Url;

static BVID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9A-Za-z])([Bb][Vv]1[0-9A-Za-z]{9})(?:$|[^0-9A-Za-z])").unwrap()
});

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://[0-9a-z\-._~:/?#\[\]@!$&'()*+,;=%]+").unwrap()
});

/// 在一段文本中查找 BV 号，并把前缀统一为大写 `BV`。
pub fn find_bvid(text: &str) -> Option<VideoId> {
    BVID_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| VideoId::from_canonical(format!("BV{}", &m.as_str()[2..])))
}

/// 取出分享文案中的第一个链接；没有协议头的 `b23.tv/xxx` 也算。
fn find_url(text: &str, short_link_hosts: &[String]) -> Option<Url> {
    if let Some(m) = URL_RE.find(text) {
        return Url::parse(m.as_str()).ok();
    }
    let bare = text.trim();
    short_link_hosts
        .iter()
        .any(|host| bare.starts_with(&format!("{}/", host)))
        .then(|| Url::parse(&format!("https://{}", bare)).ok())
        .flatten()
}

fn is_short_link(url: &Url, short_link_hosts: &[String]) -> bool {
    url.host_str().is_some_and(|host| {
        short_link_hosts
            .iter()
            .any(|h| host == h || host.ends_with(&format!(".{}", h)))
    })
}

pub struct IdentifierResolver {
    client: Arc<RobustClient>,
    short_link_hosts: Vec<String>,
}

impl IdentifierResolver {
    pub fn new(client: Arc<RobustClient>) -> Self {
        let short_link_hosts = client.config().short_link_hosts.clone();
        Self {
            client,
            short_link_hosts,
        }
    }

    pub async fn resolve(&self, input: &str) -> AppResult<VideoId> {
        let text = input.trim();
        if text.is_empty() {
            return Err(AppError::InvalidReference(input.to_string()));
        }

        let Some(url) = find_url(text, &self.short_link_hosts) else {
            // 纯 BV 号或夹杂 BV 号的文本
            return find_bvid(text).ok_or_else(|| AppError::InvalidReference(input.to_string()));
        };

        if !is_short_link(&url, &self.short_link_hosts) {
            return find_bvid(url.path())
                .or_else(|| find_bvid(text))
                .ok_or_else(|| AppError::InvalidReference(input.to_string()));
        }

        // 短链接只跳转一次，目标地址不再继续跟随
        let target = self
            .client
            .resolve_redirect(url.clone())
            .await?
            .ok_or_else(|| AppError::InvalidReference(input.to_string()))?;
        debug!("短链接 {} 跳转至 {}", url, target);
        if is_short_link(&target, &self.short_link_hosts) {
            return Err(AppError::InvalidReference(input.to_string()));
        }
        let id = find_bvid(target.path())
            .ok_or_else(|| AppError::InvalidReference(input.to_string()))?;
        info!("短链接解析完成: {} -> {}", url, id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<String> {
        vec!["b23.tv".to_string()]
    }

    #[test]
    fn test_find_bvid_normalises_prefix() {
        assert_eq!(find_bvid("BV1GJ411x7h7").unwrap().as_str(), "BV1GJ411x7h7");
        assert_eq!(find_bvid("bv1GJ411x7h7").unwrap().as_str(), "BV1GJ411x7h7");
        assert_eq!(
            find_bvid("/video/BV1GJ411x7h7/?p=2").unwrap().as_str(),
            "BV1GJ411x7h7"
        );
    }

    #[test]
    fn test_find_bvid_rejects_wrong_length() {
        assert!(find_bvid("BV1GJ411x7h").is_none());
        assert!(find_bvid("BV1GJ411x7h7x").is_none());
        assert!(find_bvid("av170001").is_none());
    }

    #[test]
    fn test_find_url_in_share_text() {
        let text = "【【官方 MV】Never Gonna Give You Up】 https://b23.tv/abc123 哔哩哔哩";
        let url = find_url(text, &hosts()).unwrap();
        assert_eq!(url.as_str(), "https://b23.tv/abc123");
        assert!(is_short_link(&url, &hosts()));
    }

    #[test]
    fn test_find_url_without_scheme() {
        let url = find_url("b23.tv/abc123", &hosts()).unwrap();
        assert_eq!(url.as_str(), "https://b23.tv/abc123");
        assert!(find_url("BV1GJ411x7h7", &hosts()).is_none());
    }

    #[test]
    fn test_short_link_host_matching() {
        let full = Url::parse("https://www.bilibili.com/video/BV1GJ411x7h7").unwrap();
        assert!(!is_short_link(&full, &hosts()));
        let sub = Url::parse("https://m.b23.tv/x").unwrap();
        assert!(is_short_link(&sub, &hosts()));
    }
}
