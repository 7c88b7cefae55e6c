// src/client.rs

use crate::{config::AppConfig, error::*, models::api::Envelope};
use anyhow::anyhow;
use log::{debug, trace};
use reqwest::{
    Response,
    header::{self, HeaderMap, HeaderValue},
    redirect,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{
    RetryTransientMiddleware, Retryable, RetryableStrategy, default_on_request_failure,
    policies::ExponentialBackoff,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use url::Url;

/// 只重试请求本身的失败 (超时、连接被重置)；
/// 服务器已经给出的任何 HTTP 响应都原样交给调用方。
struct NetworkFailuresOnly;

impl RetryableStrategy for NetworkFailuresOnly {
    fn handle(
        &self,
        res: &Result<reqwest::Response, reqwest_middleware::Error>,
    ) -> Option<Retryable> {
        match res {
            Ok(_) => None,
            Err(error) => default_on_request_failure(error),
        }
    }
}

#[derive(Clone)]
pub struct RobustClient {
    pub client: ClientWithMiddleware,
    no_redirect: ClientWithMiddleware,
    config: Arc<AppConfig>,
}

impl RobustClient {
    pub fn new(config: Arc<AppConfig>) -> AppResult<Self> {
        let client = Self::build(&config, redirect::Policy::default())?;
        let no_redirect = Self::build(&config, redirect::Policy::none())?;
        Ok(Self {
            client,
            no_redirect,
            config,
        })
    }

    fn build(config: &AppConfig, policy: redirect::Policy) -> AppResult<ClientWithMiddleware> {
        let retry_policy =
            ExponentialBackoff::builder().build_with_max_retries(config.max_retries);

        let mut headers = HeaderMap::new();
        headers.insert(header::REFERER, HeaderValue::from_static(crate::constants::REFERER));
        headers.insert(header::ORIGIN, HeaderValue::from_static(crate::constants::REFERER));

        let inner = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .redirect(policy)
            .build()?;

        Ok(ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                retry_policy,
                NetworkFailuresOnly,
            ))
            .build())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 发送 GET 请求。非 2xx 状态码不重试，直接映射为 `AppError::Api`。
    pub async fn get(&self, url: Url, cookie: Option<&str>) -> AppResult<Response> {
        debug!("GET {}", redact(&url));
        let mut request = self.client.get(url.clone());
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        let res = request.send().await?;
        let status = res.status();
        if !status.is_success() {
            return Err(AppError::Api {
                code: i64::from(status.as_u16()),
                message: status
                    .canonical_reason()
                    .unwrap_or("HTTP 请求失败")
                    .to_string(),
            });
        }
        Ok(res)
    }

    /// 请求并解析 `{code, message, data}` 外壳，不检查业务 code。
    pub async fn fetch_envelope<T: DeserializeOwned>(
        &self,
        url: Url,
        cookie: Option<&str>,
    ) -> AppResult<(Envelope<T>, HeaderMap)> {
        let res = self.get(url.clone(), cookie).await?;
        let headers = res.headers().clone();
        let body = res.text().await?;
        trace!("响应内容 ({}): {}", redact(&url), body);
        let envelope = serde_json::from_str(&body).map_err(|source| AppError::ApiParseFailed {
            url: redact(&url),
            source,
        })?;
        Ok((envelope, headers))
    }

    /// 请求并取出 `data` 字段；业务 code 非 0 时返回 `AppError::Api`。
    pub async fn fetch_data<T: DeserializeOwned>(
        &self,
        url: Url,
        cookie: Option<&str>,
    ) -> AppResult<T> {
        let (envelope, _) = self.fetch_envelope::<T>(url, cookie).await?;
        into_data(envelope)
    }

    /// 对短链接发起一次不跟随跳转的请求，返回 `Location` 指向的绝对地址。
    pub async fn resolve_redirect(&self, url: Url) -> AppResult<Option<Url>> {
        debug!("解析短链接跳转: {}", url);
        let res = self
            .no_redirect
            .get(url.clone())
            .header(header::ACCEPT, "text/html,application/xhtml+xml,*/*;q=0.8")
            .send()
            .await?;
        if !res.status().is_redirection() {
            debug!("短链接未返回跳转，状态码: {}", res.status());
            return Ok(None);
        }
        let location = res
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Other(anyhow!("跳转响应缺少 Location 头")))?;
        Ok(Some(url.join(location)?))
    }
}

pub(crate) fn into_data<T>(envelope: Envelope<T>) -> AppResult<T> {
    if envelope.code != crate::constants::api::codes::OK {
        return Err(AppError::Api {
            code: envelope.code,
            message: envelope.message,
        });
    }
    envelope.data.ok_or_else(|| AppError::Api {
        code: envelope.code,
        message: "响应中缺少 data 字段".to_string(),
    })
}

/// 日志里隐藏签名和登录密钥
fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if matches!(k.as_ref(), "w_rid" | "qrcode_key") {
                "***".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();
    if !pairs.is_empty() {
        shown.query_pairs_mut().clear().extend_pairs(pairs);
    }
    shown.to_string()
}
