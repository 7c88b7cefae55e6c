// src/api/wbi.rs

//! WBI 请求签名。
//!
//! 密钥片段 (`img_key` / `sub_key`) 来自 nav 接口返回的两张图片地址的文件名，
//! 经过固定的置换表混合出 32 位的 mixin key。签名过程:
//! 参数按键排序、追加 `wts` 时间戳、值中去掉 `!'()*`、URL 编码后拼接，
//! 再与 mixin key 相连取 MD5，结果作为 `w_rid` 参数附加在查询串末尾。

use crate::{
    client::RobustClient,
    error::*,
    models::api::{Envelope, NavData},
};
use itertools::Itertools;
use log::{debug, info};
use md5::{Digest, Md5};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex as TokioMutex;
use url::Url;

const MIXIN_KEY_ENC_TAB: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25,
    54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

/// 与 `encodeURIComponent` 保持一致，只保留 RFC 3986 的非保留字符
const WBI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const FILTERED_CHARS: [char; 5] = ['!', '\'', '(', ')', '*'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WbiKeys {
    pub img_key: String,
    pub sub_key: String,
}

impl WbiKeys {
    pub fn from_urls(img_url: &str, sub_url: &str) -> Option<Self> {
        Some(Self {
            img_key: key_from_url(img_url)?,
            sub_key: key_from_url(sub_url)?,
        })
    }

    pub fn mixin_key(&self) -> String {
        let raw: Vec<char> = format!("{}{}", self.img_key, self.sub_key).chars().collect();
        MIXIN_KEY_ENC_TAB
            .iter()
            .filter_map(|&idx| raw.get(idx))
            .take(32)
            .collect()
    }
}

fn key_from_url(url: &str) -> Option<String> {
    url.rsplit('/')
        .next()
        .and_then(|name| name.split('.').next())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
}

/// 纯函数: 相同的参数、密钥和时间戳总是得到相同的查询串。
pub fn sign(params: &[(&str, String)], keys: &WbiKeys, wts: i64) -> String {
    let mut sorted: BTreeMap<&str, String> = params
        .iter()
        .map(|(k, v)| (*k, v.chars().filter(|c| !FILTERED_CHARS.contains(c)).collect()))
        .collect();
    sorted.insert("wts", wts.to_string());

    let query = sorted
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, WBI_ENCODE_SET),
                utf8_percent_encode(v, WBI_ENCODE_SET)
            )
        })
        .join("&");

    let digest = Md5::digest(format!("{}{}", query, keys.mixin_key()).as_bytes());
    format!("{}&w_rid={}", query, hex::encode(digest))
}

struct CachedKeys {
    keys: WbiKeys,
    fetched_at: Instant,
}

/// 带缓存的签名器。缓存互斥锁在拉取期间一直持有，
/// 并发请求只会触发一次密钥拉取。
pub struct WbiSigner {
    client: Arc<RobustClient>,
    nav_url: Url,
    ttl: Duration,
    cache: TokioMutex<Option<CachedKeys>>,
}

impl WbiSigner {
    pub fn new(client: Arc<RobustClient>, nav_url: Url, ttl: Duration) -> Self {
        Self {
            client,
            nav_url,
            ttl,
            cache: TokioMutex::new(None),
        }
    }

    pub async fn keys(&self, cookie: Option<&str>) -> AppResult<WbiKeys> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.fetched_at.elapsed() < self.ttl
        {
            return Ok(cached.keys.clone());
        }
        let keys = self.fetch_keys(cookie).await?;
        *cache = Some(CachedKeys {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        Ok(keys)
    }

    /// 用其他接口顺带拿到的密钥刷新缓存
    pub async fn store(&self, keys: WbiKeys) {
        *self.cache.lock().await = Some(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        });
    }

    pub async fn invalidate(&self) {
        info!("WBI 密钥已失效，下次签名前重新获取");
        self.cache.lock().await.take();
    }

    /// 为 `url` 生成签名后的查询串，覆盖其原有查询参数。
    pub async fn sign_url(
        &self,
        url: &mut Url,
        params: &[(&str, String)],
        cookie: Option<&str>,
    ) -> AppResult<()> {
        let keys = self.keys(cookie).await?;
        let query = sign(params, &keys, chrono::Utc::now().timestamp());
        url.set_query(Some(&query));
        Ok(())
    }

    async fn fetch_keys(&self, cookie: Option<&str>) -> AppResult<WbiKeys> {
        debug!("正在从 nav 接口获取 WBI 密钥");
        // 未登录时 nav 返回 code=-101，但 data.wbi_img 依然存在
        let (envelope, _): (Envelope<NavData>, _) = self
            .client
            .fetch_envelope(self.nav_url.clone(), cookie)
            .await?;
        envelope
            .data
            .and_then(|data| data.wbi_img)
            .and_then(|img| WbiKeys::from_urls(&img.img_url, &img.sub_url))
            .ok_or_else(|| AppError::Api {
                code: envelope.code,
                message: "nav 响应中没有可用的 WBI 密钥".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_keys() -> WbiKeys {
        WbiKeys {
            img_key: "7cd084941338484aae1ad9425b84077c".to_string(),
            sub_key: "4932caff0ff746eab6f01bf08b70ac45".to_string(),
        }
    }

    fn sample_params() -> Vec<(&'static str, String)> {
        vec![
            ("foo", "114".to_string()),
            ("bar", "514".to_string()),
            ("zab", "1919810".to_string()),
        ]
    }

    #[test]
    fn test_mixin_key() {
        assert_eq!(sample_keys().mixin_key(), "ea1db124af3c7062474693fa704f4ff8");
    }

    #[test]
    fn test_sign_known_vector() {
        let query = sign(&sample_params(), &sample_keys(), 1702204169);
        assert_eq!(
            query,
            "bar=514&foo=114&wts=1702204169&zab=1919810&w_rid=8f6f2b5b3d485fe1886cec6a0be8c5d4"
        );
    }

    #[test]
    fn test_sign_is_deterministic_and_input_sensitive() {
        let base = sign(&sample_params(), &sample_keys(), 1702204169);
        assert_eq!(base, sign(&sample_params(), &sample_keys(), 1702204169));

        // 时间戳变化
        assert_ne!(base, sign(&sample_params(), &sample_keys(), 1702204170));

        // 参数变化
        let mut params = sample_params();
        params[0].1 = "115".to_string();
        assert_ne!(base, sign(&params, &sample_keys(), 1702204169));

        // 密钥变化
        let mut keys = sample_keys();
        keys.sub_key = "0000caff0ff746eab6f01bf08b70ac45".to_string();
        assert_ne!(base, sign(&sample_params(), &keys, 1702204169));
    }

    #[test]
    fn test_sign_filters_and_encodes_values() {
        let with_noise = sign(&[("keyword", "a b(!)".to_string())], &sample_keys(), 1700000000);
        let clean = sign(&[("keyword", "a b".to_string())], &sample_keys(), 1700000000);
        assert_eq!(with_noise, clean);
        assert_eq!(
            clean,
            "keyword=a%20b&wts=1700000000&w_rid=12674806e1cbb008d87410807d50b8eb"
        );
    }

    #[test]
    fn test_key_from_url() {
        let keys = WbiKeys::from_urls(
            "https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png",
            "https://i0.hdslb.com/bfs/wbi/4932caff0ff746eab6f01bf08b70ac45.png",
        )
        .unwrap();
        assert_eq!(keys, sample_keys());
        assert!(WbiKeys::from_urls("https://i0.hdslb.com/bfs/wbi/", "x.png").is_none());
    }
}
