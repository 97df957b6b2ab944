//! End-to-end flows through the HTTP router on in-memory stores.
//!
//! Each test builds its own application with a manual clock, an in-process
//! identity provider and user directory, then drives it with `oneshot`.

use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{
        HeaderValue, Request, Response, StatusCode,
        header::{CONTENT_TYPE, COOKIE, RETRY_AFTER, SET_COOKIE},
    },
};
use chrono::{Duration, Utc};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc};
use tower::ServiceExt;
use vestibule::{
    access::{
        AccessConfig, AccessStores, AdminUser, AuditLogger, Clock, ManualClock,
        MemoryIdentityProvider, MemoryUserDirectory, RateLimitRule, RateLimitTable, Role,
        RouteClass, SessionManager,
    },
    api::{self, DatabaseHandle, TrustedProxies},
};

const PASSWORD: &str = "correct horse battery staple";
const CLIENT_IP: &str = "198.51.100.7";

struct TestApp {
    app: Router,
    clock: Arc<ManualClock>,
    directory: Arc<MemoryUserDirectory>,
}

fn admin(id: &str, role: Role) -> AdminUser {
    AdminUser {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        role,
        active: true,
        created_at: Utc::now(),
        last_login_at: None,
    }
}

fn config() -> AccessConfig {
    AccessConfig::new(
        SecretString::from("session-secret-session-secret-0001".to_string()),
        SecretString::from("csrf-secret-csrf-secret-csrf-00001".to_string()),
    )
}

fn test_app_with(config: AccessConfig) -> Result<TestApp> {
    test_app_behind(config, TrustedProxies::default())
}

fn test_app_behind(config: AccessConfig, trusted_proxies: TrustedProxies) -> Result<TestApp> {
    let clock = Arc::new(ManualClock::starting_now());
    let shared_clock: Arc<dyn Clock> = clock.clone();
    let identity = Arc::new(
        MemoryIdentityProvider::new()
            .with_account("owner@example.com", PASSWORD, "owner")
            .with_account("admin@example.com", PASSWORD, "admin")
            .with_account("mod@example.com", PASSWORD, "mod"),
    );
    let directory = Arc::new(
        MemoryUserDirectory::new()
            .with_user(admin("owner", Role::SuperAdmin))
            .with_user(admin("admin", Role::Admin))
            .with_user(admin("mod", Role::Moderator)),
    );
    let audit = Arc::new(AuditLogger::new(256, shared_clock.clone()));
    let manager = Arc::new(SessionManager::new(
        config,
        AccessStores::in_memory(shared_clock.clone()),
        identity,
        directory.clone(),
        audit,
        shared_clock,
    ));
    let origin = api::frontend_origin("https://admin.example.com")?;
    Ok(TestApp {
        app: api::router(manager, DatabaseHandle(None), trusted_proxies, origin),
        clock,
        directory,
    })
}

fn test_app() -> Result<TestApp> {
    test_app_with(config())
}

/// Cookies and CSRF token carried between requests, like a browser tab.
#[derive(Clone)]
struct Browser {
    peer: SocketAddr,
    forwarded_for: Option<String>,
    session: Option<String>,
    csrf_cookie: Option<String>,
    csrf_token: Option<String>,
}

impl Default for Browser {
    fn default() -> Self {
        Self::from_peer(CLIENT_IP)
    }
}

impl Browser {
    fn from_peer(ip: &str) -> Self {
        let ip = ip.parse().unwrap_or_else(|_| [127, 0, 0, 1].into());
        Self {
            peer: SocketAddr::new(ip, 40_000),
            forwarded_for: None,
            session: None,
            csrf_cookie: None,
            csrf_token: None,
        }
    }

    fn forwarding(mut self, forwarded_for: &str) -> Self {
        self.forwarded_for = Some(forwarded_for.to_string());
        self
    }

    fn cookie_header(&self) -> Option<String> {
        let mut pairs = Vec::new();
        if let Some(session) = &self.session {
            pairs.push(format!("vestibule_session={session}"));
        }
        if let Some(csrf) = &self.csrf_cookie {
            pairs.push(format!("vestibule_csrf={csrf}"));
        }
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }

    fn absorb_cookies(&mut self, response: &Response<Body>) {
        for value in response.headers().get_all(SET_COOKIE) {
            let Some((name, value)) = value
                .to_str()
                .ok()
                .and_then(|cookie| cookie.split(';').next())
                .and_then(|pair| pair.split_once('='))
            else {
                continue;
            };
            let value = (!value.is_empty()).then(|| value.to_string());
            match name {
                "vestibule_session" => self.session = value,
                "vestibule_csrf" => self.csrf_cookie = value,
                _ => {}
            }
        }
    }

    fn request(&self, method: &str, uri: &str, body: Option<Value>) -> Result<Request<Body>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .extension(ConnectInfo(self.peer))
            .header("user-agent", "access-flow-test");
        if let Some(forwarded_for) = &self.forwarded_for {
            builder = builder.header("x-forwarded-for", forwarded_for);
        }
        if let Some(cookies) = self.cookie_header() {
            builder = builder.header(COOKIE, cookies);
        }
        if let Some(token) = &self.csrf_token {
            builder = builder.header("x-csrf-token", token);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        Ok(builder.body(body)?)
    }
}

async fn send(app: &Router, request: Request<Body>) -> Result<Response<Body>> {
    Ok(app.clone().oneshot(request).await?)
}

async fn json_body(response: Response<Body>) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    serde_json::from_slice(&bytes).context("response body is not JSON")
}

async fn fetch_csrf(app: &Router, browser: &mut Browser) -> Result<()> {
    let response = send(app, browser.request("GET", "/csrf-token", None)?).await?;
    if response.status() != StatusCode::OK {
        return Err(anyhow!("csrf token request failed: {}", response.status()));
    }
    browser.absorb_cookies(&response);
    let body = json_body(response).await?;
    browser.csrf_token = body["token"].as_str().map(str::to_string);
    Ok(())
}

async fn attempt_login(
    app: &Router,
    browser: &mut Browser,
    email: &str,
    password: &str,
) -> Result<Response<Body>> {
    fetch_csrf(app, browser).await?;
    let request = browser.request(
        "POST",
        "/login",
        Some(json!({ "email": email, "password": password })),
    )?;
    let response = send(app, request).await?;
    browser.absorb_cookies(&response);
    Ok(response)
}

async fn logged_in(app: &Router, email: &str) -> Result<Browser> {
    let mut browser = Browser::default();
    let response = attempt_login(app, &mut browser, email, PASSWORD).await?;
    if response.status() != StatusCode::OK {
        return Err(anyhow!("login failed: {}", response.status()));
    }
    let body = json_body(response).await?;
    browser.csrf_token = body["csrf"]["token"].as_str().map(str::to_string);
    Ok(browser)
}

#[tokio::test]
async fn login_session_logout_round_trip() -> Result<()> {
    let t = test_app()?;
    let browser = logged_in(&t.app, "Admin@Example.com").await?;
    assert!(browser.session.is_some());
    assert!(browser.csrf_cookie.is_some());

    let response = send(&t.app, browser.request("GET", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["user"]["id"], "admin");
    assert_eq!(body["user"]["role"], "admin");
    let permissions = body["permissions"].as_array().cloned().unwrap_or_default();
    assert_eq!(permissions.len(), 8);
    assert!(!permissions.contains(&json!("manage_users")));

    let response = send(&t.app, browser.request("DELETE", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let cleared: Vec<String> = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok().map(str::to_string))
        .collect();
    assert!(cleared.iter().all(|cookie| cookie.contains("Max-Age=0")));

    let response = send(&t.app, browser.request("GET", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn session_cookie_is_hardened() -> Result<()> {
    let t = test_app()?;
    let mut browser = Browser::default();
    let response = attempt_login(&t.app, &mut browser, "admin@example.com", PASSWORD).await?;
    let session_cookie = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|cookie| cookie.starts_with("vestibule_session="))
        .map(str::to_string)
        .unwrap_or_default();
    assert!(session_cookie.contains("HttpOnly"));
    assert!(session_cookie.contains("SameSite=Strict"));
    assert!(session_cookie.contains("Secure"));
    assert!(session_cookie.contains("Max-Age=86400"));
    Ok(())
}

#[tokio::test]
async fn login_without_csrf_is_forbidden() -> Result<()> {
    let t = test_app()?;
    let browser = Browser::default();
    let request = browser.request(
        "POST",
        "/login",
        Some(json!({ "email": "admin@example.com", "password": PASSWORD })),
    )?;
    let response = send(&t.app, request).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await?;
    assert_eq!(body["kind"], "csrf");
    Ok(())
}

#[tokio::test]
async fn forged_csrf_token_is_forbidden() -> Result<()> {
    let t = test_app()?;
    let mut browser = Browser::default();
    fetch_csrf(&t.app, &mut browser).await?;
    browser.csrf_token = browser.csrf_token.map(|token| format!("x{token}"));
    let request = browser.request(
        "POST",
        "/login",
        Some(json!({ "email": "admin@example.com", "password": PASSWORD })),
    )?;
    let response = send(&t.app, request).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn wrong_password_and_unknown_user_look_identical() -> Result<()> {
    let t = test_app()?;
    let mut browser = Browser::default();
    let wrong = attempt_login(&t.app, &mut browser, "admin@example.com", "nope").await?;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    let wrong = json_body(wrong).await?;

    let unknown = attempt_login(&t.app, &mut browser, "nobody@example.com", "nope").await?;
    assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
    let unknown = json_body(unknown).await?;

    assert_eq!(wrong, unknown);
    Ok(())
}

#[tokio::test]
async fn malformed_login_is_bad_request() -> Result<()> {
    let t = test_app()?;
    let mut browser = Browser::default();
    let response = attempt_login(&t.app, &mut browser, "not-an-email", PASSWORD).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn lockout_after_five_failures_then_expires() -> Result<()> {
    let t = test_app()?;
    let mut browser = Browser::default();

    for _ in 0..5 {
        let response = attempt_login(&t.app, &mut browser, "admin@example.com", "wrong").await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // Correct password, still locked.
    let response = attempt_login(&t.app, &mut browser, "admin@example.com", PASSWORD).await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers().get(RETRY_AFTER),
        Some(&HeaderValue::from_static("900"))
    );
    let body = json_body(response).await?;
    assert_eq!(body["kind"], "lockout");

    t.clock.advance(Duration::minutes(15) + Duration::seconds(1));
    let response = attempt_login(&t.app, &mut browser, "admin@example.com", PASSWORD).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn general_api_fixed_window_limit() -> Result<()> {
    let table = RateLimitTable::new().with_rule(
        RouteClass::GeneralApi,
        RateLimitRule::fixed(3, Duration::seconds(60)),
    );
    let t = test_app_with(config().with_rate_limits(table))?;
    let browser = Browser::default();

    for _ in 0..3 {
        let response = send(&t.app, browser.request("GET", "/session", None)?).await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let response = send(&t.app, browser.request("GET", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or_default();
    assert!((1..=60).contains(&retry_after), "retry after {retry_after}");

    t.clock.advance(Duration::seconds(61));
    let response = send(&t.app, browser.request("GET", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn audit_log_requires_permission() -> Result<()> {
    let t = test_app()?;

    let moderator = logged_in(&t.app, "mod@example.com").await?;
    let response = send(&t.app, moderator.request("GET", "/audit/events", None)?).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let admin = logged_in(&t.app, "admin@example.com").await?;
    let response = send(&t.app, admin.request("GET", "/audit/events?limit=10", None)?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let events = json_body(response).await?;
    let events = events.as_array().cloned().unwrap_or_default();
    assert!(events.len() <= 10);
    assert!(events
        .iter()
        .any(|event| event["action"] == "permission_check" && event["outcome"] == "denied"));
    assert!(events
        .iter()
        .any(|event| event["action"] == "login" && event["actor"] == "admin"));
    Ok(())
}

#[tokio::test]
async fn super_admin_revokes_sessions() -> Result<()> {
    let t = test_app()?;
    let target = logged_in(&t.app, "admin@example.com").await?;
    let owner = logged_in(&t.app, "owner@example.com").await?;

    // Admin lacks manage_users.
    let response = send(
        &t.app,
        target.request("POST", "/sessions/revoke", Some(json!({ "subject_id": "owner" })))?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(
        &t.app,
        owner.request("POST", "/sessions/revoke", Some(json!({ "subject_id": "admin" })))?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["revoked"], 1);
    assert!(body["csrf"]["token"].is_string());

    let response = send(&t.app, target.request("GET", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn revoke_without_csrf_is_forbidden() -> Result<()> {
    let t = test_app()?;
    let mut owner = logged_in(&t.app, "owner@example.com").await?;
    owner.csrf_token = None;
    let response = send(
        &t.app,
        owner.request("POST", "/sessions/revoke", Some(json!({ "subject_id": "admin" })))?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn role_change_applies_on_next_request() -> Result<()> {
    let t = test_app()?;
    let browser = logged_in(&t.app, "admin@example.com").await?;
    assert!(t.directory.set_role("admin", Role::Moderator));

    let response = send(&t.app, browser.request("GET", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["user"]["role"], "moderator");
    assert_eq!(body["permissions"].as_array().map(Vec::len), Some(3));

    assert!(t.directory.set_active("admin", false));
    let response = send(&t.app, browser.request("GET", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn idle_session_expires() -> Result<()> {
    let t = test_app()?;
    let browser = logged_in(&t.app, "admin@example.com").await?;
    t.clock.advance(Duration::hours(24) + Duration::seconds(1));
    let response = send(&t.app, browser.request("GET", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await?;
    assert_eq!(body["kind"], "authentication");
    Ok(())
}

#[tokio::test]
async fn health_docs_and_request_ids() -> Result<()> {
    let t = test_app()?;
    let browser = Browser::default();

    let response = send(&t.app, browser.request("GET", "/health", None)?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await?;
    assert_eq!(body["name"], "vestibule");
    assert_eq!(body["database"], "memory");

    let request = Request::builder()
        .uri(api::OPENAPI_JSON_PATH)
        .header("x-request-id", "fixed-id")
        .body(Body::empty())?;
    let response = send(&t.app, request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-request-id"),
        Some(&HeaderValue::from_static("fixed-id"))
    );
    let doc = json_body(response).await?;
    assert!(doc["paths"]["/login"].is_object());
    Ok(())
}

#[tokio::test]
async fn forwarded_for_from_untrusted_peer_is_ignored() -> Result<()> {
    let table = RateLimitTable::new().with_rule(
        RouteClass::GeneralApi,
        RateLimitRule::fixed(1, Duration::seconds(60)),
    );
    let t = test_app_with(
        config()
            .with_rate_limits(table)
            .with_rate_limit_bypass(vec!["10.0.0.1".to_string()]),
    )?;

    // Claiming the bypass address in a header does not skip the limit.
    let spoofer = Browser::from_peer("203.0.113.50").forwarding("10.0.0.1");
    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = send(&t.app, spoofer.request("GET", "/session", None)?).await?;
        statuses.push(response.status());
    }
    assert_eq!(
        statuses,
        [
            StatusCode::UNAUTHORIZED,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );

    // Rotating the header does not open a fresh bucket.
    for index in 0..5 {
        let rotating = Browser::from_peer("203.0.113.50").forwarding(&format!("198.51.100.{index}"));
        let response = send(&t.app, rotating.request("GET", "/session", None)?).await?;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    // The bypass applies to the real socket peer.
    let internal = Browser::from_peer("10.0.0.1");
    for _ in 0..5 {
        let response = send(&t.app, internal.request("GET", "/session", None)?).await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

#[tokio::test]
async fn trusted_proxy_keys_limits_by_forwarded_client() -> Result<()> {
    let table = RateLimitTable::new().with_rule(
        RouteClass::GeneralApi,
        RateLimitRule::fixed(1, Duration::seconds(60)),
    );
    let t = test_app_behind(
        config().with_rate_limits(table),
        TrustedProxies::parse(["10.1.0.0/16"])?,
    )?;

    let first = Browser::from_peer("10.1.0.5").forwarding("198.51.100.20");
    let response = send(&t.app, first.request("GET", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = send(&t.app, first.request("GET", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Another client behind the same proxy has its own bucket.
    let second = Browser::from_peer("10.1.0.5").forwarding("198.51.100.21");
    let response = send(&t.app, second.request("GET", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // A forged hop left of the proxy-appended address changes nothing.
    let forged = Browser::from_peer("10.1.0.5").forwarding("192.0.2.99, 198.51.100.20");
    let response = send(&t.app, forged.request("GET", "/session", None)?).await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    Ok(())
}
