// src/api/mod.rs

pub mod wbi;

use self::wbi::{WbiKeys, WbiSigner};
use crate::{
    client::RobustClient,
    constants::api::{self as endpoints, codes},
    downloader::StreamRefresh,
    error::*,
    models::{
        QualityTier, StreamDescriptor, StreamKind, StreamSelection, StreamSet, UserInfo, VideoId,
        VideoInfo, VideoPart,
        api::{DashStream, Envelope, NavData, PlayUrlData, QrGenerateData, QrPollData, ViewData},
    },
    session::{PollOutcome, QrLoginSource, QrTicket, Session, SessionManager},
};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use reqwest::header::SET_COOKIE;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use url::Url;

/// 未登录时服务器返回的业务码
const NOT_LOGGED_IN: i64 = -101;

pub struct BiliApi {
    client: Arc<RobustClient>,
    signer: WbiSigner,
    api_base: Url,
    passport_base: Url,
}

impl BiliApi {
    pub fn new(client: Arc<RobustClient>) -> AppResult<Self> {
        let api_base = Url::parse(&client.config().api_base)?;
        let passport_base = Url::parse(&client.config().passport_base)?;
        let signer = WbiSigner::new(
            client.clone(),
            api_base.join(endpoints::NAV)?,
            client.config().wbi_key_ttl,
        );
        Ok(Self {
            client,
            signer,
            api_base,
            passport_base,
        })
    }

    pub fn client(&self) -> &RobustClient {
        &self.client
    }

    /// 视频信息接口不要求签名
    pub async fn video_info(
        &self,
        id: &VideoId,
        session: Option<&Session>,
    ) -> AppResult<VideoInfo> {
        let mut url = self.api_base.join(endpoints::VIDEO_VIEW)?;
        url.query_pairs_mut().append_pair("bvid", id.as_str());
        let data: ViewData = self
            .client
            .fetch_data(url, session.map(Session::cookie_header))
            .await
            .map_err(|e| session_error(e, session))?;
        debug!("获取视频信息成功: {} ({} 个分P)", data.title, data.pages.len());
        Ok(view_to_info(id, data))
    }

    /// 获取某个分P的全部码流。请求总是签名；没有会话时附加 `try_look=1`。
    pub async fn streams(
        &self,
        id: &VideoId,
        part: &VideoPart,
        session: Option<&Session>,
    ) -> AppResult<StreamSet> {
        let mut params = vec![
            ("bvid", id.as_str().to_string()),
            ("cid", part.cid.to_string()),
            ("qn", QualityTier::K8.0.to_string()),
            ("fnval", endpoints::FNVAL_ALL_DASH.to_string()),
            ("fnver", "0".to_string()),
            ("fourk", "1".to_string()),
        ];
        if session.is_none() {
            params.push(("try_look", "1".to_string()));
        }
        let data: PlayUrlData = self
            .signed_fetch(endpoints::PLAY_URL_WBI, &params, session)
            .await?;
        let set = build_stream_set(data);
        debug!(
            "分P {} 共有 {} 条码流，声明支持的画质: {:?}",
            part.index,
            set.streams.len(),
            set.accepted
        );
        Ok(set)
    }

    /// 查询登录用户信息，顺带刷新 WBI 密钥缓存。
    pub async fn user_info(&self, session: &Session) -> AppResult<UserInfo> {
        let url = self.api_base.join(endpoints::NAV)?;
        let (envelope, _): (Envelope<NavData>, _) = self
            .client
            .fetch_envelope(url, Some(session.cookie_header()))
            .await?;
        if let Some(img) = envelope.data.as_ref().and_then(|d| d.wbi_img.as_ref())
            && let Some(keys) = WbiKeys::from_urls(&img.img_url, &img.sub_url)
        {
            self.signer.store(keys).await;
        }
        if envelope.code == NOT_LOGGED_IN {
            return Err(AppError::SessionExpired);
        }
        let data = crate::client::into_data(envelope)?;
        if !data.is_login {
            return Err(AppError::SessionExpired);
        }
        Ok(UserInfo {
            mid: data.mid.unwrap_or_default(),
            name: data.uname.unwrap_or_default(),
            is_vip: data.vip_status.unwrap_or_default() == 1,
        })
    }

    /// 签名请求。签名被拒绝时作废密钥并重试一次，再次被拒绝则返回 `SignatureRejected`。
    async fn signed_fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        session: Option<&Session>,
    ) -> AppResult<T> {
        let cookie = session.map(Session::cookie_header);
        for attempt in 0..2 {
            let mut url = self.api_base.join(path)?;
            self.signer.sign_url(&mut url, params, cookie).await?;
            match self.client.fetch_data::<T>(url, cookie).await {
                Err(AppError::Api { code, .. }) if code == codes::ACCESS_DENIED => {
                    warn!("WBI 签名被拒绝 (第 {} 次)", attempt + 1);
                    self.signer.invalidate().await;
                }
                other => return other.map_err(|e| session_error(e, session)),
            }
        }
        Err(AppError::SignatureRejected)
    }

    pub async fn qr_generate(&self) -> AppResult<QrTicket> {
        let url = self.passport_base.join(endpoints::QR_GENERATE)?;
        let data: QrGenerateData = self.client.fetch_data(url, None).await?;
        Ok(QrTicket {
            url: data.url,
            key: data.qrcode_key,
        })
    }

    pub async fn qr_poll(&self, key: &str) -> AppResult<PollOutcome> {
        let mut url = self.passport_base.join(endpoints::QR_POLL)?;
        url.query_pairs_mut().append_pair("qrcode_key", key);
        let (envelope, headers): (Envelope<QrPollData>, _) =
            self.client.fetch_envelope(url, None).await?;
        let data = crate::client::into_data(envelope)?;

        Ok(match data.code {
            codes::QR_CONFIRMED => {
                let set_cookies: Vec<String> = headers
                    .get_all(SET_COOKIE)
                    .iter()
                    .filter_map(|v| v.to_str().ok().map(str::to_string))
                    .collect();
                let session = Session::from_login_response(&data.url, &set_cookies, Utc::now())
                    .ok_or_else(|| AppError::Api {
                        code: data.code,
                        message: "登录已确认，但响应中没有会话凭据".to_string(),
                    })?;
                PollOutcome::Confirmed(session)
            }
            codes::QR_SCANNED => PollOutcome::Scanned,
            codes::QR_WAITING => PollOutcome::Pending,
            codes::QR_EXPIRED => PollOutcome::Expired,
            other => {
                return Err(AppError::Api {
                    code: other,
                    message: data.message,
                });
            }
        })
    }
}

#[async_trait]
impl QrLoginSource for BiliApi {
    async fn issue(&self) -> AppResult<QrTicket> {
        self.qr_generate().await
    }

    async fn poll(&self, key: &str) -> AppResult<PollOutcome> {
        self.qr_poll(key).await
    }
}

/// 带着会话请求却被告知未登录，说明会话已失效
fn session_error(error: AppError, session: Option<&Session>) -> AppError {
    match error {
        AppError::Api { code, .. } if code == NOT_LOGGED_IN && session.is_some() => {
            AppError::SessionExpired
        }
        other => other,
    }
}

fn view_to_info(id: &VideoId, data: ViewData) -> VideoInfo {
    let mut parts: Vec<VideoPart> = data
        .pages
        .into_iter()
        .map(|p| VideoPart {
            cid: p.cid,
            index: p.page,
            title: p.part,
            duration: p.duration,
        })
        .collect();
    if parts.is_empty() && data.cid != 0 {
        parts.push(VideoPart {
            cid: data.cid,
            index: 1,
            title: data.title.clone(),
            duration: data.duration,
        });
    }
    VideoInfo {
        id: id.clone(),
        aid: data.aid,
        title: data.title,
        cover: data.pic,
        duration: data.duration,
        owner: data.owner.map(|o| o.name).unwrap_or_default(),
        parts,
    }
}

/// PCDN 节点 (域名含 `xy`) 经常限速，排到镜像列表最后
fn order_mirrors(primary: String, backups: Option<Vec<String>>) -> Vec<String> {
    let (mut preferred, pcdn): (Vec<String>, Vec<String>) = std::iter::once(primary)
        .chain(backups.unwrap_or_default())
        .partition(|u| !is_pcdn(u));
    preferred.extend(pcdn);
    preferred.dedup();
    preferred
}

fn is_pcdn(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.contains("xy")))
        .unwrap_or(false)
}

fn dash_descriptor(stream: DashStream, kind: StreamKind) -> StreamDescriptor {
    let tier = QualityTier(stream.id);
    StreamDescriptor {
        kind,
        tier,
        codec: stream.codecs,
        urls: order_mirrors(stream.base_url, stream.backup_url),
        requires_session: kind == StreamKind::Video && tier.requires_session(),
        bitrate: stream.bandwidth,
        size: None,
    }
}

pub(crate) fn build_stream_set(data: PlayUrlData) -> StreamSet {
    let accepted = data.accept_quality.into_iter().map(QualityTier).collect();
    let mut streams = Vec::new();

    if let Some(dash) = data.dash {
        streams.extend(
            dash.video
                .into_iter()
                .map(|s| dash_descriptor(s, StreamKind::Video)),
        );
        streams.extend(
            dash.audio
                .unwrap_or_default()
                .into_iter()
                .map(|s| dash_descriptor(s, StreamKind::Audio)),
        );
    } else if let Some(first) = data.durl.and_then(|d| d.into_iter().next()) {
        let tier = QualityTier(data.quality);
        streams.push(StreamDescriptor {
            kind: StreamKind::Muxed,
            tier,
            codec: "flv".to_string(),
            urls: order_mirrors(first.url, first.backup_url),
            requires_session: tier.requires_session(),
            bitrate: 0,
            size: (first.size > 0).then_some(first.size),
        });
    }

    StreamSet { streams, accepted }
}

/// 用当前会话重新获取码流地址，保持原有的档位和编码不变。
pub struct ApiStreamRefresher {
    api: Arc<BiliApi>,
    sessions: Arc<SessionManager>,
}

impl ApiStreamRefresher {
    pub fn new(api: Arc<BiliApi>, sessions: Arc<SessionManager>) -> Self {
        Self { api, sessions }
    }
}

#[async_trait]
impl StreamRefresh for ApiStreamRefresher {
    async fn refresh(
        &self,
        video: &VideoId,
        part: &VideoPart,
        selection: &StreamSelection,
    ) -> AppResult<StreamSelection> {
        let session = self.sessions.current();
        let set = self.api.streams(video, part, session.as_ref()).await?;
        let pick = |old: &Option<StreamDescriptor>| -> AppResult<Option<StreamDescriptor>> {
            let Some(old) = old else {
                return Ok(None);
            };
            set.streams
                .iter()
                .find(|s| s.kind == old.kind && s.tier == old.tier && s.codec == old.codec)
                .cloned()
                .map(Some)
                .ok_or_else(|| AppError::QualityUnavailable {
                    requested: old.tier.0,
                    reason: "刷新后的码流列表中已没有原先选择的码流".to_string(),
                })
        };
        let refreshed = StreamSelection {
            video: pick(&selection.video)?,
            audio: pick(&selection.audio)?,
        };
        info!("已刷新 {} 分P {} 的码流地址", video, part.index);
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcdn_mirrors_go_last() {
        let urls = order_mirrors(
            "https://xy123x45x67x89xy.mcdn.bilivideo.cn/v.m4s".to_string(),
            Some(vec![
                "https://upos-sz-mirrorcos.bilivideo.com/v.m4s".to_string(),
                "https://cn-gddg-ct-01-01.bilivideo.com/v.m4s".to_string(),
            ]),
        );
        assert_eq!(
            urls,
            vec![
                "https://upos-sz-mirrorcos.bilivideo.com/v.m4s",
                "https://cn-gddg-ct-01-01.bilivideo.com/v.m4s",
                "https://xy123x45x67x89xy.mcdn.bilivideo.cn/v.m4s",
            ]
        );
    }

    #[test]
    fn test_build_stream_set_from_dash() {
        let json = r#"{
            "accept_quality": [116, 80, 64],
            "quality": 80,
            "dash": {
                "video": [
                    {"id": 116, "baseUrl": "https://a/116.m4s", "bandwidth": 5000, "codecs": "avc1.640032"},
                    {"id": 80, "baseUrl": "https://a/80.m4s", "backupUrl": ["https://b/80.m4s"], "bandwidth": 3000, "codecs": "hev1.1.6.L120.90"}
                ],
                "audio": [{"id": 30280, "baseUrl": "https://a/audio.m4s", "bandwidth": 320000, "codecs": "mp4a.40.2"}]
            }
        }"#;
        let data: PlayUrlData = serde_json::from_str(json).unwrap();
        let set = build_stream_set(data);
        assert_eq!(set.accepted, vec![QualityTier(116), QualityTier(80), QualityTier(64)]);
        assert_eq!(set.streams.len(), 3);
        assert!(set.streams[0].requires_session);
        assert!(!set.streams[1].requires_session);
        assert_eq!(set.streams[1].urls.len(), 2);
        assert_eq!(set.streams[2].kind, StreamKind::Audio);
        assert!(!set.streams[2].requires_session);
    }

    #[test]
    fn test_build_stream_set_from_durl() {
        let json = r#"{
            "accept_quality": [64, 32],
            "quality": 64,
            "durl": [{"url": "https://a/v.flv", "size": 1024}]
        }"#;
        let data: PlayUrlData = serde_json::from_str(json).unwrap();
        let set = build_stream_set(data);
        assert_eq!(set.streams.len(), 1);
        assert_eq!(set.streams[0].kind, StreamKind::Muxed);
        assert_eq!(set.streams[0].tier, QualityTier::P720);
        assert_eq!(set.streams[0].size, Some(1024));
    }
}
