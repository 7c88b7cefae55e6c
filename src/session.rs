// src/session.rs

//! 登录会话与扫码登录状态机。
//!
//! `Idle → QrIssued → Scanned → Confirmed` 为成功路径，
//! `QrIssued/Scanned → Expired` 为失败终态。终态之后的轮询不会再改变状态。

use crate::{constants, error::*};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use url::Url;

/// 登录凭据只认这几个 Cookie
const SESSION_COOKIE_NAMES: [&str; 4] = ["SESSDATA", "bili_jct", "DedeUserID", "DedeUserID__ckMd5"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub cookie: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(cookie: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            cookie: cookie.into(),
            expires_at,
        }
    }

    pub fn with_default_ttl(cookie: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(
            cookie,
            now + ChronoDuration::days(constants::SESSION_DEFAULT_TTL_DAYS),
        )
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn cookie_header(&self) -> &str {
        &self.cookie
    }

    /// 从扫码确认后的 `Set-Cookie` 响应头和跨域登录地址 (查询参数中带 SESSDATA 等)
    /// 中提取会话。两处都有时以 `Set-Cookie` 为准。
    ///
    /// Cookie 值保持服务器下发的编码形式 (例如 SESSDATA 中的 `%2C`)，不做解码。
    pub fn from_login_response(
        login_url: &str,
        set_cookies: &[String],
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut push = |name: &str, value: &str| {
            if SESSION_COOKIE_NAMES.contains(&name) && !pairs.iter().any(|(k, _)| k == name) {
                pairs.push((name.to_string(), value.to_string()));
            }
        };

        for header in set_cookies {
            let pair = header.split(';').next().and_then(|kv| kv.split_once('='));
            if let Some((name, value)) = pair {
                push(name.trim(), value.trim());
            }
        }

        let mut expires_at = None;
        let query = Url::parse(login_url)
            .ok()
            .and_then(|u| u.query().map(str::to_owned))
            .unwrap_or_default();
        for (key, value) in query.split('&').filter_map(|kv| kv.split_once('=')) {
            if key == "Expires" {
                expires_at = value
                    .parse::<i64>()
                    .ok()
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single());
            } else {
                push(key, value);
            }
        }

        if !pairs.iter().any(|(k, _)| k == "SESSDATA") {
            return None;
        }

        let cookie = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ");
        Some(match expires_at {
            Some(expires_at) => Self::new(cookie, expires_at),
            None => Self::with_default_ttl(cookie, now),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrTicket {
    /// 需要编码成二维码的地址
    pub url: String,
    /// 轮询凭据
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Pending,
    Scanned,
    Confirmed(Session),
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    QrIssued(QrTicket),
    Scanned(QrTicket),
    Confirmed,
    Expired,
}

impl LoginState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoginState::Confirmed | LoginState::Expired)
    }

    fn ticket(&self) -> Option<&QrTicket> {
        match self {
            LoginState::QrIssued(t) | LoginState::Scanned(t) => Some(t),
            _ => None,
        }
    }
}

/// 扫码登录的二维码签发与轮询来源，测试时可替换为脚本化的实现。
#[async_trait]
pub trait QrLoginSource: Send + Sync {
    async fn issue(&self) -> AppResult<QrTicket>;
    async fn poll(&self, key: &str) -> AppResult<PollOutcome>;
}

/// 不涉及任何 I/O 的扫码登录状态机。
#[derive(Debug)]
pub struct QrLoginMachine {
    state: LoginState,
}

impl Default for QrLoginMachine {
    fn default() -> Self {
        Self {
            state: LoginState::Idle,
        }
    }
}

impl QrLoginMachine {
    pub fn state(&self) -> &LoginState {
        &self.state
    }

    pub fn issue(&mut self, ticket: QrTicket) -> AppResult<()> {
        if self.state != LoginState::Idle {
            return Err(AppError::InvalidOperation(
                "只有空闲状态才能开始新的扫码登录".to_string(),
            ));
        }
        self.state = LoginState::QrIssued(ticket);
        Ok(())
    }

    /// 应用一次轮询结果，确认登录时返回会话。终态下为空操作。
    pub fn apply(&mut self, outcome: PollOutcome) -> Option<Session> {
        let Some(ticket) = self.state.ticket().cloned() else {
            debug!("登录状态 {:?} 下忽略轮询结果", self.state);
            return None;
        };
        match outcome {
            PollOutcome::Pending => None,
            PollOutcome::Scanned => {
                self.state = LoginState::Scanned(ticket);
                None
            }
            PollOutcome::Confirmed(session) => {
                self.state = LoginState::Confirmed;
                Some(session)
            }
            PollOutcome::Expired => {
                self.state = LoginState::Expired;
                None
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = LoginState::Idle;
    }
}

/// 唯一持有会话的组件。其他组件只能通过 `current()` 拿到有效会话的副本。
pub struct SessionManager {
    source: Arc<dyn QrLoginSource>,
    poll_interval: Duration,
    session: RwLock<Option<Session>>,
    login: Mutex<QrLoginMachine>,
}

impl SessionManager {
    pub fn new(source: Arc<dyn QrLoginSource>, poll_interval: Duration) -> Self {
        Self {
            source,
            poll_interval,
            session: RwLock::new(None),
            login: Mutex::new(QrLoginMachine::default()),
        }
    }

    /// 恢复本地保存的会话；已过期的会话直接丢弃。
    pub fn restore(&self, session: Session) -> bool {
        if !session.is_valid_at(Utc::now()) {
            warn!("本地保存的会话已于 {} 过期，需要重新登录", session.expires_at);
            return false;
        }
        *write_lock(&self.session) = Some(session);
        true
    }

    pub fn current(&self) -> Option<Session> {
        self.current_at(Utc::now())
    }

    /// 返回 `now` 时刻仍然有效的会话。过期会话会被清除，登录状态回到空闲。
    pub fn current_at(&self, now: DateTime<Utc>) -> Option<Session> {
        {
            let guard = read_lock(&self.session);
            match guard.as_ref() {
                Some(s) if s.is_valid_at(now) => return Some(s.clone()),
                None => return None,
                Some(_) => {}
            }
        }
        {
            let mut guard = write_lock(&self.session);
            let expired = guard.as_ref().is_some_and(|s| !s.is_valid_at(now));
            if !expired {
                return guard.clone();
            }
            *guard = None;
        }
        info!("登录会话已过期，回到未登录状态");
        // 不能同时持有会话锁和状态机锁
        let mut machine = lock(&self.login);
        if *machine.state() == LoginState::Confirmed {
            machine.reset();
        }
        None
    }

    pub fn login_state(&self) -> LoginState {
        self.login_state_at(Utc::now())
    }

    /// `now` 时刻的登录状态。会话已过期时先回到空闲。
    pub fn login_state_at(&self, now: DateTime<Utc>) -> LoginState {
        self.current_at(now);
        lock(&self.login).state().clone()
    }

    pub fn logout(&self) {
        info!("退出登录");
        *write_lock(&self.session) = None;
        lock(&self.login).reset();
    }

    /// `Idle → QrIssued`: 向服务器申请二维码。
    pub async fn start_login(&self) -> AppResult<QrTicket> {
        {
            let mut machine = lock(&self.login);
            match machine.state() {
                LoginState::QrIssued(_) | LoginState::Scanned(_) => {
                    return Err(AppError::InvalidOperation(
                        "扫码登录已在进行中".to_string(),
                    ));
                }
                // 上一轮已结束，开始新一轮
                LoginState::Confirmed | LoginState::Expired => machine.reset(),
                LoginState::Idle => {}
            }
        }
        let ticket = self.source.issue().await?;
        lock(&self.login).issue(ticket.clone())?;
        info!("已生成登录二维码");
        Ok(ticket)
    }

    /// 轮询一次。空闲或终态时不发起任何请求。
    pub async fn poll_once(&self) -> AppResult<LoginState> {
        let key = lock(&self.login).state().ticket().map(|t| t.key.clone());
        let Some(key) = key else {
            return Ok(self.login_state());
        };
        let outcome = self.source.poll(&key).await?;
        debug!("扫码登录轮询结果: {:?}", outcome);

        let mut machine = lock(&self.login);
        // 轮询期间登录可能已被取消或换了新的二维码
        if machine.state().ticket().map(|t| t.key.as_str()) != Some(key.as_str()) {
            return Ok(machine.state().clone());
        }
        if let Some(session) = machine.apply(outcome) {
            info!("扫码登录成功，会话有效期至 {}", session.expires_at);
            *write_lock(&self.session) = Some(session);
        }
        Ok(machine.state().clone())
    }

    /// 按固定间隔轮询，直到登录确认、二维码过期或被取消。
    /// 取消或轮询出错后状态回到 `Idle`，可以重新开始登录。
    pub async fn wait_for_login(&self, cancel: &CancellationToken) -> AppResult<LoginState> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("扫码登录已取消");
                    lock(&self.login).reset();
                    return Ok(LoginState::Idle);
                }
                _ = ticker.tick() => {}
            }
            let state = match self.poll_once().await {
                Ok(state) => state,
                Err(e) => {
                    warn!("扫码登录轮询失败: {}", e);
                    lock(&self.login).reset();
                    return Err(e);
                }
            };
            if state.is_terminal() || state == LoginState::Idle {
                return Ok(state);
            }
        }
    }
}

// 锁中毒只会发生在持锁线程 panic 时，此时沿用内部数据即可
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read_lock<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> QrTicket {
        QrTicket {
            url: "https://account.bilibili.com/h5/account-h5/auth/scan-web?qrcode_key=k1".into(),
            key: "k1".into(),
        }
    }

    fn session() -> Session {
        Session::new("SESSDATA=abc", Utc.timestamp_opt(1_900_000_000, 0).unwrap())
    }

    #[test]
    fn test_machine_happy_path() {
        let mut m = QrLoginMachine::default();
        m.issue(ticket()).unwrap();
        assert_eq!(m.apply(PollOutcome::Pending), None);
        assert_eq!(m.state(), &LoginState::QrIssued(ticket()));
        assert_eq!(m.apply(PollOutcome::Scanned), None);
        assert_eq!(m.state(), &LoginState::Scanned(ticket()));
        assert_eq!(m.apply(PollOutcome::Confirmed(session())), Some(session()));
        assert_eq!(m.state(), &LoginState::Confirmed);
    }

    #[test]
    fn test_terminal_states_absorb_polls() {
        let mut m = QrLoginMachine::default();
        m.issue(ticket()).unwrap();
        m.apply(PollOutcome::Expired);
        assert_eq!(m.state(), &LoginState::Expired);
        assert_eq!(m.apply(PollOutcome::Confirmed(session())), None);
        assert_eq!(m.apply(PollOutcome::Scanned), None);
        assert_eq!(m.state(), &LoginState::Expired);

        let mut m = QrLoginMachine::default();
        m.issue(ticket()).unwrap();
        m.apply(PollOutcome::Confirmed(session()));
        assert_eq!(m.apply(PollOutcome::Expired), None);
        assert_eq!(m.state(), &LoginState::Confirmed);
    }

    #[test]
    fn test_issue_only_from_idle() {
        let mut m = QrLoginMachine::default();
        m.issue(ticket()).unwrap();
        assert!(m.issue(ticket()).is_err());
    }

    #[test]
    fn test_session_from_login_url() {
        let url = "https://passport.biligame.com/x/passport-login/web/crossDomain?DedeUserID=42&DedeUserID__ckMd5=abcd&Expires=1900000000&SESSDATA=s%2C1%2Cx&bili_jct=jct&gourl=https%3A%2F%2Fwww.bilibili.com";
        let s = Session::from_login_response(url, &[], Utc::now()).unwrap();
        assert_eq!(
            s.cookie,
            "DedeUserID=42; DedeUserID__ckMd5=abcd; SESSDATA=s%2C1%2Cx; bili_jct=jct"
        );
        assert_eq!(s.expires_at.timestamp(), 1_900_000_000);
    }

    #[test]
    fn test_set_cookie_values_win_over_login_url() {
        let url = "https://passport.biligame.com/x/passport-login/web/crossDomain?SESSDATA=from_url&bili_jct=jct&Expires=1900000000";
        let headers = vec![
            "SESSDATA=a1b2%2C1900000000%2Cc3d4; Path=/; Domain=bilibili.com; HttpOnly".to_string(),
        ];
        let s = Session::from_login_response(url, &headers, Utc::now()).unwrap();
        assert_eq!(s.cookie, "SESSDATA=a1b2%2C1900000000%2Cc3d4; bili_jct=jct");
        assert_eq!(s.expires_at.timestamp(), 1_900_000_000);
    }

    #[test]
    fn test_session_from_set_cookie_headers() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let headers = vec![
            "SESSDATA=xyz; Path=/; Domain=bilibili.com; HttpOnly".to_string(),
            "sid=ignored; Path=/".to_string(),
        ];
        let s = Session::from_login_response("", &headers, now).unwrap();
        assert_eq!(s.cookie, "SESSDATA=xyz");
        assert!(s.expires_at > now);
        assert!(Session::from_login_response("", &["sid=1".to_string()], now).is_none());
    }
}
