// src/models/mod.rs

pub mod api;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 规范化后的视频编号 (BV 号)。只能由解析器构造。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(String);

impl VideoId {
    pub(crate) fn from_canonical(bvid: String) -> Self {
        Self(bvid)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoPart {
    pub cid: u64,
    /// 从 1 开始的分P序号
    pub index: u32,
    pub title: String,
    #[serde(default)]
    pub duration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfo {
    pub id: VideoId,
    pub aid: u64,
    pub title: String,
    pub cover: String,
    pub duration: u64,
    pub owner: String,
    pub parts: Vec<VideoPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub mid: u64,
    pub name: String,
    pub is_vip: bool,
}

/// 画质档位，数值越大画质越高。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityTier(pub u32);

impl QualityTier {
    pub const P240: Self = Self(6);
    pub const P360: Self = Self(16);
    pub const P480: Self = Self(32);
    pub const P720: Self = Self(64);
    pub const P720_60: Self = Self(74);
    pub const P1080: Self = Self(80);
    pub const P1080_PLUS: Self = Self(112);
    pub const P1080_60: Self = Self(116);
    pub const K4: Self = Self(120);
    pub const HDR: Self = Self(125);
    pub const DOLBY_VISION: Self = Self(126);
    pub const K8: Self = Self(127);

    const LABELS: &'static [(u32, &'static str, &'static [&'static str])] = &[
        (127, "8K 超高清", &["8k"]),
        (126, "杜比视界", &["dolby", "dv"]),
        (125, "HDR 真彩", &["hdr"]),
        (120, "4K 超清", &["4k", "2160p"]),
        (116, "1080P 60帧", &["1080p60"]),
        (112, "1080P 高码率", &["1080p+"]),
        (80, "1080P 高清", &["1080p"]),
        (74, "720P 60帧", &["720p60"]),
        (64, "720P 高清", &["720p"]),
        (32, "480P 清晰", &["480p"]),
        (16, "360P 流畅", &["360p"]),
        (6, "240P 极速", &["240p"]),
    ];

    /// 免登录 (try_look) 最高只能拿到 1080P
    pub fn requires_session(self) -> bool {
        self > Self::P1080
    }

    pub fn label(self) -> String {
        Self::LABELS
            .iter()
            .find(|(id, _, _)| *id == self.0)
            .map(|(_, label, _)| label.to_string())
            .unwrap_or_else(|| format!("画质 {}", self.0))
    }

    /// 接受档位数值 (`80`) 或常见写法 (`1080p`, `4K`, `best`)。
    pub fn parse(input: &str) -> Option<Self> {
        let text = input.trim().to_lowercase();
        if text == "best" {
            return Some(Self::K8);
        }
        if let Ok(id) = text.parse::<u32>() {
            return Some(Self(id));
        }
        Self::LABELS
            .iter()
            .find(|(_, _, aliases)| aliases.contains(&text.as_str()))
            .map(|(id, _, _)| Self(*id))
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Video,
    Audio,
    /// 旧式 FLV/MP4 单文件流，音视频已合在一起
    Muxed,
}

/// 某个分P的一种具体码流。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    pub tier: QualityTier,
    pub codec: String,
    /// 主地址在前，其余为备用镜像
    pub urls: Vec<String>,
    pub requires_session: bool,
    pub bitrate: u64,
    #[serde(default)]
    pub size: Option<u64>,
}

impl StreamDescriptor {
    /// 编码偏好，数值越小越优先: AVC > HEVC > AV1 > 其他
    pub fn codec_rank(&self) -> u8 {
        let codec = self.codec.to_lowercase();
        if codec.starts_with("avc") {
            0
        } else if codec.starts_with("hev") || codec.starts_with("hvc") {
            1
        } else if codec.starts_with("av01") {
            2
        } else {
            3
        }
    }
}

/// 一个分P的全部可用码流。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamSet {
    pub streams: Vec<StreamDescriptor>,
    /// 服务器声明支持的画质档位 (可能包含需要登录的档位)
    pub accepted: Vec<QualityTier>,
}

/// 一次下载最终选定的码流组合。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSelection {
    pub video: Option<StreamDescriptor>,
    pub audio: Option<StreamDescriptor>,
}

impl StreamSelection {
    pub fn tier(&self) -> Option<QualityTier> {
        self.video.as_ref().map(|v| v.tier)
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownloadMode {
    #[default]
    VideoWithAudio,
    AudioOnly,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    #[default]
    Mp3,
    M4a,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
        }
    }
}

/// 请求的画质需要登录而当前没有会话时的处理方式
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// 直接报告 `QualityUnavailable`，交给调用方决定
    #[default]
    Strict,
    /// 自动降级到不需要登录的最高档位
    Downgrade,
}
