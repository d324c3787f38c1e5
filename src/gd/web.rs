use crate::gd::auth::{AuthOutcome, AuthRequest, Authenticator, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TS};
use crate::gd::logbuf::LogEntry;
use crate::gd::supervisor::{now_ms, StatusSnapshot, Supervisor};
use askama::Template;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, Request, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response as AxumResponse};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bodies are only read to be signed; control requests carry little or nothing.
const MAX_BODY_BYTES: usize = 64 * 1024;
const MIN_LOG_TAIL: usize = 10;
const DASHBOARD_LOG_LINES: usize = 40;

#[derive(Clone)]
pub struct WebState {
    sup: Supervisor,
    auth: Arc<Authenticator>,
}

impl WebState {
    pub fn new(sup: Supervisor, auth: Arc<Authenticator>) -> Self {
        Self { sup, auth }
    }
}

pub fn build_router(state: WebState) -> Router {
    let protected = Router::new()
        .route("/status", get(status))
        .route("/restart", post(restart))
        .route("/stop", post(stop))
        .route("/start", post(start))
        .route("/logs", get(logs))
        .route("/mobile", get(mobile_page))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .fallback(not_found)
        .with_state(state)
}

fn json_error(code: StatusCode, msg: impl Into<String>) -> AxumResponse {
    (code, Json(serde_json::json!({ "ok": false, "error": msg.into() }))).into_response()
}

async fn not_found(uri: Uri) -> AxumResponse {
    json_error(StatusCode::NOT_FOUND, format!("not found: {}", uri.path()))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "service": "guardian", "ts": now_ms() }))
}

// ---------------- auth ----------------

fn query_params(uri: &Uri) -> HashMap<String, String> {
    Query::<HashMap<String, String>>::try_from_uri(uri)
        .map(|Query(q)| q)
        .unwrap_or_default()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn auth_middleware(
    State(st): State<WebState>,
    req: Request<Body>,
    next: middleware::Next,
) -> AxumResponse {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => return json_error(StatusCode::PAYLOAD_TOO_LARGE, format!("unreadable body: {e}")),
    };
    let query = query_params(&parts.uri);
    let query_token = query.get("token").or_else(|| query.get("k")).map(String::as_str);

    let outcome = st.auth.verify(
        &AuthRequest {
            method: parts.method.as_str(),
            path: parts.uri.path(),
            query_token,
            authorization: header_str(&parts.headers, header::AUTHORIZATION.as_str()),
            timestamp: header_str(&parts.headers, HEADER_TS),
            nonce: header_str(&parts.headers, HEADER_NONCE),
            signature: header_str(&parts.headers, HEADER_SIGNATURE),
            body: &bytes,
        },
        now_ms(),
    );
    if let AuthOutcome::Rejected(reason) = outcome {
        st.sup.logs().event(
            "auth",
            format!("outcome=rejected method={} path={} reason={reason:?}", parts.method, parts.uri.path()),
        );
        return json_error(StatusCode::UNAUTHORIZED, reason);
    }
    // Control actions are audited; reads are not.
    if parts.method != Method::GET {
        st.sup.logs().event(
            "auth",
            format!(
                "outcome=accepted mode={} method={} path={} nonces={}",
                outcome.mode().unwrap_or("-"),
                parts.method,
                parts.uri.path(),
                st.auth.nonce_count()
            ),
        );
    }

    let mut req = Request::from_parts(parts, Body::from(bytes));
    req.extensions_mut().insert(outcome);
    next.run(req).await
}

/// A dashboard form post: authenticated by query token and not asking for JSON.
fn is_form_submission(outcome: Option<&AuthOutcome>, headers: &HeaderMap) -> bool {
    if outcome != Some(&AuthOutcome::Query) {
        return false;
    }
    let content_type = header_str(headers, header::CONTENT_TYPE.as_str()).unwrap_or("");
    if content_type.starts_with("application/x-www-form-urlencoded") || content_type.starts_with("multipart/form-data") {
        return true;
    }
    header_str(headers, header::ACCEPT.as_str()).is_some_and(|a| a.contains("text/html"))
}

/// Percent-encode a query value (RFC 3986 unreserved characters pass through).
fn encode_query_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn dashboard_redirect(st: &WebState) -> AxumResponse {
    Redirect::to(&format!("/mobile?k={}", encode_query_value(st.auth.secret()))).into_response()
}

// ---------------- JSON API ----------------

#[derive(Serialize)]
struct ActionResponse {
    #[serde(flatten)]
    status: StatusSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    restarted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started: Option<bool>,
}

async fn status(State(st): State<WebState>) -> Json<StatusSnapshot> {
    Json(st.sup.status())
}

fn action_reply(st: &WebState, req: &Request<Body>, restarted: Option<bool>, started: Option<bool>) -> AxumResponse {
    if is_form_submission(req.extensions().get::<AuthOutcome>(), req.headers()) {
        return dashboard_redirect(st);
    }
    Json(ActionResponse {
        status: st.sup.status(),
        restarted,
        started,
    })
    .into_response()
}

async fn restart(State(st): State<WebState>, req: Request<Body>) -> AxumResponse {
    match st.sup.restart("operator restart").await {
        Ok(restarted) => action_reply(&st, &req, Some(restarted), None),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("restart failed: {e}")),
    }
}

async fn stop(State(st): State<WebState>, req: Request<Body>) -> AxumResponse {
    match st.sup.stop("operator stop", true).await {
        Ok(_) => action_reply(&st, &req, None, None),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("stop failed: {e}")),
    }
}

async fn start(State(st): State<WebState>, req: Request<Body>) -> AxumResponse {
    match st.sup.start("operator start", false) {
        Ok(started) => action_reply(&st, &req, None, Some(started)),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("start failed: {e}")),
    }
}

/// Requested tail length, clamped to `[10, limit]`; absent or malformed means `limit`.
fn clamp_tail(raw: Option<&str>, limit: usize) -> usize {
    let n = raw
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(limit);
    n.max(MIN_LOG_TAIL).min(limit)
}

#[derive(Serialize)]
struct LogsResponse {
    ok: bool,
    logs: Vec<LogEntry>,
}

async fn logs(State(st): State<WebState>, uri: Uri) -> Json<LogsResponse> {
    let ring = st.sup.logs();
    let n = clamp_tail(query_params(&uri).get("tail").map(String::as_str), ring.limit());
    Json(LogsResponse {
        ok: true,
        logs: ring.tail(n),
    })
}

// ---------------- dashboard ----------------

struct DashboardLogLine {
    time: String,
    stream: &'static str,
    line: String,
}

#[derive(Template)]
#[template(path = "mobile.html")]
struct MobileTemplate {
    title: &'static str,
    build_banner: String,
    token: String,
    guardian_pid: u32,
    uptime: String,
    running: bool,
    phase: &'static str,
    pid: String,
    started_at: String,
    heartbeat_age: String,
    stale_heartbeat: bool,
    last_exit: String,
    manual_stop: bool,
    cooldown_remaining: String,
    recent_restart_count: usize,
    log_lines: Vec<DashboardLogLine>,
}

fn fmt_epoch_ms(ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| ms.to_string())
}

fn fmt_duration_ms(ms: u64) -> String {
    let secs = ms / 1000;
    match secs {
        0 => format!("{ms}ms"),
        1..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m{}s", secs / 60, secs % 60),
        _ => format!("{}h{}m", secs / 3600, (secs % 3600) / 60),
    }
}

async fn mobile_page(State(st): State<WebState>) -> AxumResponse {
    let s = st.sup.status();
    let w = &s.worker;
    let t = MobileTemplate {
        title: "guardian",
        build_banner: crate::gd::build_info::banner(),
        token: encode_query_value(st.auth.secret()),
        guardian_pid: s.guardian_pid,
        uptime: fmt_duration_ms(s.uptime_ms),
        running: w.running,
        phase: w.phase,
        pid: w.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
        started_at: w.started_at_ms.map(fmt_epoch_ms).unwrap_or_else(|| "-".to_string()),
        heartbeat_age: w
            .heartbeat_age_ms
            .map(fmt_duration_ms)
            .unwrap_or_else(|| "unknown".to_string()),
        stale_heartbeat: w.stale_heartbeat,
        last_exit: match w.last_exit {
            Some(e) => format!(
                "code={} at {}",
                e.code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
                fmt_epoch_ms(e.at_ms)
            ),
            None => "-".to_string(),
        },
        manual_stop: w.manual_stop,
        cooldown_remaining: fmt_duration_ms(w.cooldown_remaining_ms),
        recent_restart_count: w.recent_restart_count,
        log_lines: st
            .sup
            .logs()
            .tail(DASHBOARD_LOG_LINES)
            .into_iter()
            .map(|e| DashboardLogLine {
                time: fmt_epoch_ms(e.ts),
                stream: e.stream.as_str(),
                line: e.line,
            })
            .collect(),
    };
    match t.render() {
        Ok(s) => Html(s).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ---------------- serve ----------------

/// Serve until `shutting_down` flips, then let in-flight requests finish.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutting_down: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let shutdown = async move {
        while !shutting_down.load(Ordering::Relaxed) {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    };
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gd::auth::sign;
    use crate::gd::config::GuardianConfig;
    use crate::gd::logbuf::{LogRing, Stream};
    use crate::gd::supervisor::WorkerCommand;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const SECRET: &str = "0123456789abcdef-test-secret";

    fn state(dir: &std::path::Path) -> WebState {
        let mut cfg = GuardianConfig::defaults(None);
        cfg.heartbeat_file = dir.join("heartbeat.json");
        cfg.secret_file = dir.join("secret");
        cfg.log_tail_limit = 50;
        let logs = Arc::new(LogRing::new(cfg.log_tail_limit));
        let command = WorkerCommand::from_argv(&["sleep".to_string(), "30".to_string()]).unwrap();
        let sup = Supervisor::new(cfg, command, logs);
        WebState::new(sup, Arc::new(Authenticator::new(SECRET, 300_000, 600_000)))
    }

    async fn body_json(resp: AxumResponse) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn healthz_needs_no_auth() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(state(dir.path()));
        let resp = app.oneshot(get_req("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["ok"], true);
        assert_eq!(v["service"], "guardian");
        assert!(v["ts"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn status_rejects_missing_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(state(dir.path()));
        let resp = app.oneshot(get_req("/status")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let v = body_json(resp).await;
        assert_eq!(v["ok"], false);
        assert!(v["error"].as_str().unwrap().contains("missing credentials"));
    }

    #[tokio::test]
    async fn status_accepts_bearer_and_query_token() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());

        let req = Request::builder()
            .uri("/status")
            .header(header::AUTHORIZATION, format!("Bearer {SECRET}"))
            .body(Body::empty())
            .unwrap();
        let resp = build_router(st.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["ok"], true);
        assert_eq!(v["worker"]["running"], false);
        assert!(v["worker"]["lastExit"].is_null());
        assert!(v["worker"]["heartbeatAgeMs"].is_null());
        assert_eq!(v["worker"]["recentRestartCount"], 0);

        let resp = build_router(st.clone())
            .oneshot(get_req(&format!("/status?k={SECRET}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = build_router(st)
            .oneshot(get_req("/status?token=wrong"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn signed_request_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());
        let ts = now_ms().to_string();
        let sig = sign(SECRET, "GET", "/status", &ts, "nonce-1", b"").unwrap();
        let mk = || {
            Request::builder()
                .uri("/status?verbose=1")
                .header(HEADER_TS, ts.as_str())
                .header(HEADER_NONCE, "nonce-1")
                .header(HEADER_SIGNATURE, format!("sha256={sig}"))
                .body(Body::empty())
                .unwrap()
        };
        let resp = build_router(st.clone()).oneshot(mk()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = build_router(st).oneshot(mk()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let v = body_json(resp).await;
        assert_eq!(v["error"], "nonce already used");
    }

    #[tokio::test]
    async fn signed_body_is_covered() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());
        let ts = now_ms().to_string();
        let sig = sign(SECRET, "POST", "/stop", &ts, "n-body", b"{\"why\":\"x\"}").unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/stop")
            .header(HEADER_TS, ts.as_str())
            .header(HEADER_NONCE, "n-body")
            .header(HEADER_SIGNATURE, sig.as_str())
            .body(Body::from("{\"why\":\"y\"}"))
            .unwrap();
        let resp = build_router(st).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(state(dir.path()));
        let resp = app.oneshot(get_req("/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let v = body_json(resp).await;
        assert_eq!(v["ok"], false);
    }

    #[tokio::test]
    async fn logs_tail_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());
        for i in 0..80 {
            st.sup.logs().push(Stream::Stdout, format!("line {i}"));
        }
        let resp = build_router(st.clone())
            .oneshot(get_req(&format!("/logs?tail=3&k={SECRET}")))
            .await
            .unwrap();
        let v = body_json(resp).await;
        let logs = v["logs"].as_array().unwrap();
        assert_eq!(logs.len(), 10);
        assert_eq!(logs[9]["line"], "line 79");
        assert_eq!(logs[9]["stream"], "stdout");

        let resp = build_router(st)
            .oneshot(get_req(&format!("/logs?tail=100000&k={SECRET}")))
            .await
            .unwrap();
        let v = body_json(resp).await;
        assert_eq!(v["logs"].as_array().unwrap().len(), 50);
    }

    #[tokio::test]
    async fn repeated_tail_parameter_still_answers_json() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());
        for i in 0..20 {
            st.sup.logs().push(Stream::Stdout, format!("line {i}"));
        }
        let resp = build_router(st)
            .oneshot(get_req(&format!("/logs?tail=1&tail=2&k={SECRET}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["ok"], true);
        assert_eq!(v["logs"].as_array().unwrap().len(), 10);
    }

    #[test]
    fn tail_defaults_to_limit() {
        assert_eq!(clamp_tail(None, 500), 500);
        assert_eq!(clamp_tail(Some("abc"), 500), 500);
        assert_eq!(clamp_tail(Some("0"), 500), 10);
        assert_eq!(clamp_tail(Some("42"), 500), 42);
    }

    #[tokio::test]
    async fn start_then_stop_via_api() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());
        let req = Request::builder()
            .method("POST")
            .uri("/start")
            .header(header::AUTHORIZATION, format!("Bearer {SECRET}"))
            .body(Body::empty())
            .unwrap();
        let resp = build_router(st.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["started"], true);
        assert_eq!(v["worker"]["running"], true);
        assert!(v.get("restarted").is_none());

        let req = Request::builder()
            .method("POST")
            .uri("/stop")
            .header(header::AUTHORIZATION, format!("Bearer {SECRET}"))
            .body(Body::empty())
            .unwrap();
        let resp = build_router(st.clone()).oneshot(req).await.unwrap();
        let v = body_json(resp).await;
        assert_eq!(v["worker"]["running"], false);
        assert_eq!(v["worker"]["manualStop"], true);
        assert!(v.get("started").is_none());
        let audited = st
            .sup
            .logs()
            .tail(usize::MAX)
            .iter()
            .filter(|e| e.line.contains("outcome=accepted mode=bearer method=POST path=/"))
            .count();
        assert_eq!(audited, 2);
        st.sup.shutdown().await;
    }

    #[tokio::test]
    async fn dashboard_form_post_redirects_back() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());
        let req = Request::builder()
            .method("POST")
            .uri(format!("/restart?k={SECRET}"))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::empty())
            .unwrap();
        let resp = build_router(st.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        let loc = resp.headers().get(header::LOCATION).unwrap().to_str().unwrap();
        assert_eq!(loc, format!("/mobile?k={SECRET}"));
        st.sup.shutdown().await;
    }

    #[tokio::test]
    async fn mobile_page_renders_forms_with_token() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());
        let resp = build_router(st)
            .oneshot(get_req(&format!("/mobile?k={SECRET}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains(&format!("/restart?k={SECRET}")));
        assert!(html.contains(&format!("/stop?k={SECRET}")));
        assert!(html.contains(&format!("/start?k={SECRET}")));
    }

    #[test]
    fn query_values_are_percent_encoded() {
        assert_eq!(encode_query_value("abc-_.~09"), "abc-_.~09");
        assert_eq!(encode_query_value("a b&c=d"), "a%20b%26c%3Dd");
    }
}
