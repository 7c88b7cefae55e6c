// tests/resolver_test.rs

use bili_dl::client::RobustClient;
use bili_dl::config::AppConfig;
use bili_dl::error::AppError;
use bili_dl::resolver::{IdentifierResolver, find_bvid};
use std::sync::Arc;

const BVID: &str = "BV1GJ411x7h7";

/// 把模拟服务器的地址也当作短链接域名
fn resolver_for(server: &mockito::ServerGuard) -> IdentifierResolver {
    let config = AppConfig {
        short_link_hosts: vec!["b23.tv".to_string(), "127.0.0.1".to_string()],
        ..AppConfig::with_mock_server(&server.url())
    };
    let client = Arc::new(RobustClient::new(Arc::new(config)).expect("Failed to create client"));
    IdentifierResolver::new(client)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_all_input_forms_resolve_to_same_id() {
    let mut server = mockito::Server::new_async().await;
    let short = server
        .mock("GET", "/aBcD123")
        .with_status(302)
        .with_header(
            "Location",
            &format!("https://www.bilibili.com/video/{}?share_source=copy_web", BVID),
        )
        .expect(2)
        .create_async()
        .await;

    let resolver = resolver_for(&server);
    let expected = find_bvid(BVID).unwrap();

    let bare = resolver.resolve(BVID).await.unwrap();
    let lower = resolver.resolve("bv1GJ411x7h7").await.unwrap();
    let full = resolver
        .resolve(&format!("https://www.bilibili.com/video/{}/?p=2", BVID))
        .await
        .unwrap();
    let short_url = resolver
        .resolve(&format!("{}/aBcD123", server.url()))
        .await
        .unwrap();
    let share_text = resolver
        .resolve(&format!("【测试视频】 {}/aBcD123 哔哩哔哩", server.url()))
        .await
        .unwrap();

    for id in [bare, lower, full, short_url, share_text] {
        assert_eq!(id, expected);
    }
    short.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_short_link_follows_exactly_one_hop() {
    let mut server = mockito::Server::new_async().await;
    let first = server
        .mock("GET", "/first")
        .with_status(302)
        .with_header("Location", &format!("{}/second", server.url()))
        .expect(1)
        .create_async()
        .await;
    let second = server
        .mock("GET", "/second")
        .with_status(302)
        .with_header(
            "Location",
            &format!("https://www.bilibili.com/video/{}", BVID),
        )
        .expect(0)
        .create_async()
        .await;

    let resolver = resolver_for(&server);
    let err = resolver
        .resolve(&format!("{}/first", server.url()))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::InvalidReference(_)), "unexpected error: {:?}", err);
    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_short_link_without_redirect_is_invalid() {
    let mut server = mockito::Server::new_async().await;
    let _gone = server
        .mock("GET", "/dead")
        .with_status(404)
        .create_async()
        .await;

    let resolver = resolver_for(&server);
    let err = resolver
        .resolve(&format!("{}/dead", server.url()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidReference(_)), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn test_unrecognised_inputs_are_rejected() {
    let config = Arc::new(AppConfig::default());
    let client = Arc::new(RobustClient::new(config).expect("Failed to create client"));
    let resolver = IdentifierResolver::new(client);

    for input in [
        "",
        "   ",
        "hello world",
        "BV1GJ411x7h",
        "https://www.bilibili.com/bangumi/play/ep12345",
    ] {
        let err = resolver.resolve(input).await.unwrap_err();
        assert!(
            matches!(err, AppError::InvalidReference(_)),
            "input {:?} gave {:?}",
            input,
            err
        );
    }
}
