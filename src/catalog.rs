// src/catalog.rs

//! 码流选择。纯函数，不发起任何网络请求。

use crate::{
    error::*,
    models::{
        DownloadMode, FallbackPolicy, QualityTier, StreamDescriptor, StreamKind, StreamSelection,
        StreamSet,
    },
};
use log::{debug, info};
use std::cmp::Reverse;

/// 按请求的画质和会话状态选出要下载的码流。
///
/// 请求的档位需要登录而当前没有会话时:
/// - `Strict`: 立即返回 `QualityUnavailable`，由调用方决定下一步；
/// - `Downgrade`: 在免登录档位中寻找不高于请求档位的最高档。
pub fn select(
    set: &StreamSet,
    requested: QualityTier,
    has_session: bool,
    policy: FallbackPolicy,
    mode: DownloadMode,
) -> AppResult<StreamSelection> {
    if mode == DownloadMode::AudioOnly {
        return select_audio_only(set, requested);
    }

    if requested.requires_session() && !has_session && policy == FallbackPolicy::Strict {
        return Err(AppError::QualityUnavailable {
            requested: requested.0,
            reason: format!("{} 需要登录后才能下载", requested.label()),
        });
    }

    let eligible: Vec<&StreamDescriptor> = set
        .streams
        .iter()
        .filter(|s| matches!(s.kind, StreamKind::Video | StreamKind::Muxed))
        .filter(|s| has_session || !s.requires_session)
        .filter(|s| s.tier <= requested)
        .collect();

    let Some(tier) = eligible.iter().map(|s| s.tier).max() else {
        return Err(AppError::QualityUnavailable {
            requested: requested.0,
            reason: if has_session {
                "没有不高于该档位的码流".to_string()
            } else {
                "没有不高于该档位且免登录可用的码流".to_string()
            },
        });
    };

    let video = eligible
        .into_iter()
        .filter(|s| s.tier == tier)
        .min_by_key(|s| (s.codec_rank(), Reverse(s.bitrate)))
        .cloned();

    if tier != requested {
        info!("请求的 {} 不可用，降级为 {}", requested, tier);
    }

    let audio = match video.as_ref().map(|v| v.kind) {
        Some(StreamKind::Video) => best_audio(set),
        _ => None,
    };
    debug!(
        "选定视频流: {:?}, 音频流: {:?}",
        video.as_ref().map(|v| (&v.codec, v.tier)),
        audio.as_ref().map(|a| a.bitrate)
    );
    Ok(StreamSelection { video, audio })
}

fn best_audio(set: &StreamSet) -> Option<StreamDescriptor> {
    set.streams
        .iter()
        .filter(|s| s.kind == StreamKind::Audio)
        .max_by_key(|s| s.bitrate)
        .cloned()
}

/// 只要音频时选码率最高的音频流；旧式单文件流则整体交给合并器抽取音轨。
fn select_audio_only(set: &StreamSet, requested: QualityTier) -> AppResult<StreamSelection> {
    let audio = best_audio(set).or_else(|| {
        set.streams
            .iter()
            .filter(|s| s.kind == StreamKind::Muxed && !s.requires_session)
            .max_by_key(|s| s.tier)
            .cloned()
    });
    match audio {
        Some(audio) => Ok(StreamSelection {
            video: None,
            audio: Some(audio),
        }),
        None => Err(AppError::QualityUnavailable {
            requested: requested.0,
            reason: "没有可用的音频流".to_string(),
        }),
    }
}
