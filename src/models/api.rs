// src/models/api.rs

use serde::Deserialize;

// --- 通用结构体 ---

/// 所有接口共用的响应外壳: `{ code, message, data }`
#[derive(Deserialize, Debug, Clone)]
pub struct Envelope<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

// --- 用户信息 / WBI 密钥 (nav) ---

#[derive(Deserialize, Debug, Clone)]
pub struct NavData {
    #[serde(rename = "isLogin", default)]
    pub is_login: bool,
    pub mid: Option<u64>,
    pub uname: Option<String>,
    pub vip_status: Option<u8>,
    pub wbi_img: Option<WbiImg>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WbiImg {
    pub img_url: String,
    pub sub_url: String,
}

// --- 视频信息 (view) ---

#[derive(Deserialize, Debug, Clone)]
pub struct ViewData {
    pub bvid: String,
    pub aid: u64,
    pub title: String,
    #[serde(default)]
    pub pic: String,
    #[serde(default)]
    pub duration: u64,
    pub owner: Option<ViewOwner>,
    #[serde(default)]
    pub pages: Vec<ViewPage>,
    #[serde(default)]
    pub cid: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ViewOwner {
    pub name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ViewPage {
    pub cid: u64,
    pub page: u32,
    #[serde(default)]
    pub part: String,
    #[serde(default)]
    pub duration: u64,
}

// --- 播放地址 (playurl) ---

#[derive(Deserialize, Debug, Clone)]
pub struct PlayUrlData {
    #[serde(default)]
    pub accept_quality: Vec<u32>,
    #[serde(default)]
    pub quality: u32,
    pub dash: Option<DashData>,
    pub durl: Option<Vec<DurlData>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DashData {
    #[serde(default)]
    pub video: Vec<DashStream>,
    #[serde(default)]
    pub audio: Option<Vec<DashStream>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DashStream {
    pub id: u32,
    #[serde(rename = "baseUrl", alias = "base_url")]
    pub base_url: String,
    #[serde(rename = "backupUrl", alias = "backup_url", default)]
    pub backup_url: Option<Vec<String>>,
    #[serde(default)]
    pub bandwidth: u64,
    #[serde(default)]
    pub codecs: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DurlData {
    pub url: String,
    #[serde(default)]
    pub backup_url: Option<Vec<String>>,
    #[serde(default)]
    pub size: u64,
}

// --- 扫码登录 ---

#[derive(Deserialize, Debug, Clone)]
pub struct QrGenerateData {
    pub url: String,
    pub qrcode_key: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct QrPollData {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    /// 登录成功时为跨域登录地址，查询参数里带有 Cookie 和过期时间
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub refresh_token: String,
}
