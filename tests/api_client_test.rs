// tests/api_client_test.rs

use bili_dl::api::BiliApi;
use bili_dl::client::RobustClient;
use bili_dl::config::AppConfig;
use bili_dl::error::AppError;
use bili_dl::models::{StreamKind, VideoPart};
use bili_dl::resolver::find_bvid;
use bili_dl::session::{PollOutcome, Session};
use chrono::{Duration as ChronoDuration, Utc};
use mockito::Matcher;
use serde_json::json;
use std::sync::Arc;

const BVID: &str = "BV1xx411c7mD";

fn api_for(server: &mockito::ServerGuard) -> BiliApi {
    let config = Arc::new(AppConfig::with_mock_server(&server.url()));
    let client = Arc::new(RobustClient::new(config).expect("Failed to create client"));
    BiliApi::new(client).expect("Failed to create api")
}

fn sample_part() -> VideoPart {
    VideoPart {
        cid: 279786,
        index: 1,
        title: "P1".to_string(),
        duration: 212,
    }
}

fn nav_body(code: i64, is_login: bool) -> String {
    json!({
        "code": code,
        "message": "0",
        "data": {
            "isLogin": is_login,
            "mid": 42,
            "uname": "tester",
            "vip_status": 1,
            "wbi_img": {
                "img_url": "https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png",
                "sub_url": "https://i0.hdslb.com/bfs/wbi/4932caff0ff746eab6f01bf08b70ac45.png"
            }
        }
    })
    .to_string()
}

fn playurl_body() -> String {
    json!({
        "code": 0,
        "message": "0",
        "data": {
            "accept_quality": [80, 64, 32, 16],
            "quality": 80,
            "dash": {
                "video": [
                    { "id": 80, "baseUrl": "https://upos-sz-mirrorcos.bilivideo.com/v80.m4s", "bandwidth": 2000000, "codecs": "avc1.640032" },
                    { "id": 64, "baseUrl": "https://upos-sz-mirrorcos.bilivideo.com/v64.m4s", "bandwidth": 900000, "codecs": "avc1.640028" }
                ],
                "audio": [
                    { "id": 30280, "baseUrl": "https://upos-sz-mirrorcos.bilivideo.com/a.m4s", "bandwidth": 320000, "codecs": "mp4a.40.2" }
                ]
            }
        }
    })
    .to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_500_is_not_retried_and_surfaces_status() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/x/web-interface/view")
        .match_query(Matcher::Any)
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let api = api_for(&server);
    let id = find_bvid(BVID).unwrap();
    let err = api.video_info(&id, None).await.unwrap_err();

    assert!(
        matches!(err, AppError::Api { code: 500, .. }),
        "unexpected error: {:?}",
        err
    );
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_video_info_parses_parts() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/x/web-interface/view")
        .match_query(Matcher::UrlEncoded("bvid".into(), BVID.into()))
        .with_status(200)
        .with_body(
            json!({
                "code": 0,
                "message": "0",
                "data": {
                    "bvid": BVID,
                    "aid": 170001,
                    "title": "测试视频",
                    "pic": "https://i0.hdslb.com/cover.jpg",
                    "duration": 400,
                    "owner": { "name": "UP" },
                    "cid": 1001,
                    "pages": [
                        { "cid": 1001, "page": 1, "part": "上", "duration": 200 },
                        { "cid": 1002, "page": 2, "part": "下", "duration": 200 }
                    ]
                }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let api = api_for(&server);
    let id = find_bvid(BVID).unwrap();
    let info = api.video_info(&id, None).await.unwrap();

    assert_eq!(info.id, id);
    assert_eq!(info.title, "测试视频");
    assert_eq!(info.owner, "UP");
    assert_eq!(info.parts.len(), 2);
    assert_eq!(info.parts[1].cid, 1002);
    assert_eq!(info.parts[1].index, 2);
    assert_eq!(info.parts[1].title, "下");
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_signature_rejected_twice_is_fatal() {
    let mut server = mockito::Server::new_async().await;
    // 第一次签名前取一次密钥，被拒绝后作废密钥再取一次
    let nav = server
        .mock("GET", "/x/web-interface/nav")
        .with_status(200)
        .with_body(nav_body(-101, false))
        .expect(2)
        .create_async()
        .await;
    let playurl = server
        .mock("GET", "/x/player/wbi/playurl")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({ "code": -403, "message": "访问权限不足" }).to_string())
        .expect(2)
        .create_async()
        .await;

    let api = api_for(&server);
    let id = find_bvid(BVID).unwrap();
    let err = api.streams(&id, &sample_part(), None).await.unwrap_err();

    assert!(matches!(err, AppError::SignatureRejected), "unexpected error: {:?}", err);
    nav.assert_async().await;
    playurl.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_signature_retry_succeeds_after_key_refresh() {
    let mut server = mockito::Server::new_async().await;
    let _nav = server
        .mock("GET", "/x/web-interface/nav")
        .with_status(200)
        .with_body(nav_body(-101, false))
        .expect(2)
        .create_async()
        .await;
    let rejected = server
        .mock("GET", "/x/player/wbi/playurl")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({ "code": -403, "message": "访问权限不足" }).to_string())
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("GET", "/x/player/wbi/playurl")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("bvid".into(), BVID.into()),
            Matcher::UrlEncoded("try_look".into(), "1".into()),
            Matcher::Regex("w_rid=[0-9a-f]{32}".into()),
            Matcher::Regex("wts=[0-9]+".into()),
        ]))
        .with_status(200)
        .with_body(playurl_body())
        .expect(1)
        .create_async()
        .await;

    let api = api_for(&server);
    let id = find_bvid(BVID).unwrap();
    let set = api.streams(&id, &sample_part(), None).await.unwrap();

    assert_eq!(set.streams.len(), 3);
    assert_eq!(
        set.streams.iter().filter(|s| s.kind == StreamKind::Audio).count(),
        1
    );
    assert!(set.streams.iter().all(|s| !s.requires_session));
    rejected.assert_async().await;
    accepted.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_user_info_reports_expired_session() {
    let mut server = mockito::Server::new_async().await;
    let _nav = server
        .mock("GET", "/x/web-interface/nav")
        .with_status(200)
        .with_body(nav_body(-101, false))
        .create_async()
        .await;

    let api = api_for(&server);
    let session = Session::new("SESSDATA=stale", Utc::now() + ChronoDuration::days(1));
    let err = api.user_info(&session).await.unwrap_err();
    assert!(matches!(err, AppError::SessionExpired), "unexpected error: {:?}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_user_info_reads_profile() {
    let mut server = mockito::Server::new_async().await;
    let nav = server
        .mock("GET", "/x/web-interface/nav")
        .match_header("cookie", "SESSDATA=fresh")
        .with_status(200)
        .with_body(nav_body(0, true))
        .create_async()
        .await;

    let api = api_for(&server);
    let session = Session::new("SESSDATA=fresh", Utc::now() + ChronoDuration::days(1));
    let user = api.user_info(&session).await.unwrap();
    assert_eq!(user.mid, 42);
    assert_eq!(user.name, "tester");
    assert!(user.is_vip);
    nav.assert_async().await;
}

fn poll_body(code: i64, url: &str) -> String {
    json!({
        "code": 0,
        "message": "0",
        "data": { "code": code, "message": "", "url": url, "refresh_token": "" }
    })
    .to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_qr_poll_maps_service_codes() {
    let mut server = mockito::Server::new_async().await;
    let login_url = "https://passport.biligame.com/x/passport-login/web/crossDomain?DedeUserID=42&DedeUserID__ckMd5=abc&Expires=4102444800&SESSDATA=token%2C1&bili_jct=csrf&gourl=https%3A%2F%2Fwww.bilibili.com";
    let cases = [
        ("waiting", 86101, ""),
        ("scanned", 86090, ""),
        ("expired", 86038, ""),
        ("confirmed", 0, login_url),
    ];
    let mut mocks = Vec::new();
    for (key, code, url) in cases {
        mocks.push(
            server
                .mock("GET", "/x/passport-login/web/qrcode/poll")
                .match_query(Matcher::UrlEncoded("qrcode_key".into(), key.into()))
                .with_status(200)
                .with_body(poll_body(code, url))
                .create_async()
                .await,
        );
    }

    let api = api_for(&server);
    assert_eq!(api.qr_poll("waiting").await.unwrap(), PollOutcome::Pending);
    assert_eq!(api.qr_poll("scanned").await.unwrap(), PollOutcome::Scanned);
    assert_eq!(api.qr_poll("expired").await.unwrap(), PollOutcome::Expired);
    match api.qr_poll("confirmed").await.unwrap() {
        PollOutcome::Confirmed(session) => {
            assert!(session.cookie.contains("SESSDATA=token%2C1"));
            assert!(session.cookie.contains("bili_jct=csrf"));
            assert_eq!(session.expires_at.timestamp(), 4102444800);
        }
        other => panic!("expected confirmed, got {:?}", other),
    }
    for mock in mocks {
        mock.assert_async().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_qr_poll_unknown_code_is_api_error() {
    let mut server = mockito::Server::new_async().await;
    let _poll = server
        .mock("GET", "/x/passport-login/web/qrcode/poll")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(poll_body(86000, ""))
        .create_async()
        .await;

    let api = api_for(&server);
    let err = api.qr_poll("any").await.unwrap_err();
    assert!(matches!(err, AppError::Api { code: 86000, .. }), "unexpected error: {:?}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_qr_poll_keeps_set_cookie_values_encoded() {
    let mut server = mockito::Server::new_async().await;
    let login_url = "https://passport.biligame.com/x/passport-login/web/crossDomain?SESSDATA=url%2Cvalue&Expires=4102444800";
    let _poll = server
        .mock("GET", "/x/passport-login/web/qrcode/poll")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("set-cookie", "SESSDATA=e3f1%2C4102444800%2Cab12; Path=/; HttpOnly")
        .with_header("set-cookie", "bili_jct=csrf; Path=/")
        .with_body(poll_body(0, login_url))
        .create_async()
        .await;

    let api = api_for(&server);
    match api.qr_poll("confirmed").await.unwrap() {
        PollOutcome::Confirmed(session) => {
            assert_eq!(
                session.cookie,
                "SESSDATA=e3f1%2C4102444800%2Cab12; bili_jct=csrf"
            );
            assert_eq!(session.expires_at.timestamp(), 4102444800);
        }
        other => panic!("expected confirmed, got {:?}", other),
    }
}
