// src/constants.rs

use std::time::Duration;

pub const UI_WIDTH: usize = 88;
pub const FILENAME_TRUNCATE_LENGTH: usize = 65;
pub const MAX_FILENAME_BYTES: usize = 200;
pub const CONFIG_DIR_NAME: &str = concat!(".", clap::crate_name!());
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const LOG_FILE_NAME: &str = "bili-dl.log";
pub const LOG_FALLBACK_FILE_NAME: &str = "bili-dl-fallback.log";
pub const QUEUE_FILE_NAME: &str = "queue.json";
pub const QUEUE_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_SAVE_DIR: &str = "downloads";
pub const DEFAULT_SELECTION: &str = "all";
pub const DEFAULT_QUALITY: u32 = 80;
pub const DEFAULT_MAX_CONCURRENT: usize = 2;
pub const DEFAULT_CONNECTIONS: u32 = 16;
pub const DEFAULT_TASK_RETRIES: u32 = 3;
pub const COOKIE_ENV_VAR: &str = "BILI_COOKIE";

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const REFERER: &str = "https://www.bilibili.com";

pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const QR_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(2);
pub const WBI_KEY_TTL: Duration = Duration::from_secs(60 * 60);
/// 登录响应未携带过期时间时使用的会话有效期
pub const SESSION_DEFAULT_TTL_DAYS: i64 = 180;

pub const SHORT_LINK_HOSTS: &[&str] = &["b23.tv", "bili2233.cn"];

pub mod api {
    pub const API_BASE: &str = "https://api.bilibili.com";
    pub const PASSPORT_BASE: &str = "https://passport.bilibili.com";

    pub const NAV: &str = "/x/web-interface/nav";
    pub const VIDEO_VIEW: &str = "/x/web-interface/view";
    pub const PLAY_URL_WBI: &str = "/x/player/wbi/playurl";
    pub const QR_GENERATE: &str = "/x/passport-login/web/qrcode/generate";
    pub const QR_POLL: &str = "/x/passport-login/web/qrcode/poll";

    /// DASH + HDR + 4K + 杜比 + 8K + AV1
    pub const FNVAL_ALL_DASH: &str = "4048";

    pub mod codes {
        pub const OK: i64 = 0;
        pub const ACCESS_DENIED: i64 = -403;
        pub const QR_CONFIRMED: i64 = 0;
        pub const QR_EXPIRED: i64 = 86038;
        pub const QR_SCANNED: i64 = 86090;
        pub const QR_WAITING: i64 = 86101;
    }
}

pub const HELP_LOGIN_GUIDE: &str = r#"
1. 使用 --login 启动扫码登录，终端会显示一个登录链接。
2. 将链接转换为二维码 (或直接在已登录的手机浏览器中打开)，
   使用哔哩哔哩手机客户端扫码并确认登录。
3. 登录成功后，会话会被保存到本地配置文件，过期后需要重新登录。
4. 也可以手动提供 Cookie:
   - 命令行参数: --cookie "SESSDATA=...; bili_jct=..."
   - 环境变量:   BILI_COOKIE
----------------------------------------------
未登录时最高可免登录获取 1080P 画质；
1080P+ / 1080P60 / 4K / HDR / 8K 需要登录 (部分需要大会员)。"#;
