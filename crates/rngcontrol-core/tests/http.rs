//! Session and queue clients against a local mock of the scheduling service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Form, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use rngcontrol_core::{
    Authenticator, ControlConfig, ControlError, QueueClient, QueueId, ResultsBundle,
    SchedulingService, SessionManager, TrialResult,
};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const SESSION_COOKIE: &str = "connect.sid=abc123";

#[derive(Default)]
struct MockService {
    /// Queue state returned on admission, as raw ids.
    queue: Vec<Value>,
    item_on_top: Option<Value>,
    start_message: Option<String>,
    remove_message: Option<String>,
    /// Answer every queue verb with this status instead.
    force_status: Option<StatusCode>,
    logins: Vec<HashMap<String, String>>,
    paths: Vec<String>,
    submissions: Vec<(String, HashMap<String, String>)>,
}

type Shared = Arc<Mutex<MockService>>;

fn has_session(headers: &HeaderMap) -> bool {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|c| c.contains(SESSION_COOKIE))
}

async fn login(State(state): State<Shared>, Form(form): Form<HashMap<String, String>>) -> Response {
    let ok = form.get("password").map(String::as_str) == Some("hunter2");
    state.lock().unwrap().logins.push(form);
    if ok {
        (
            [(header::SET_COOKIE, format!("{SESSION_COOKIE}; Path=/; HttpOnly"))],
            Json(json!({ "user": { "id": 1 } })),
        )
            .into_response()
    } else {
        Json(json!({ "message": "Wrong email or password" })).into_response()
    }
}

async fn queue_verb(
    State(state): State<Shared>,
    Path((verb, file)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let mut s = state.lock().unwrap();
    s.paths.push(format!("/queue/{verb}/{file}"));
    if let Some(status) = s.force_status {
        return status.into_response();
    }
    if !has_session(&headers) {
        return Json(json!({ "message": "You must be logged in" })).into_response();
    }
    let Some(id) = file.strip_suffix(".json") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match verb.as_str() {
        "add" => Json(json!({
            "item": { "id": 5, "xp_id": id },
            "state": s.queue,
        }))
        .into_response(),
        "update" => Json(json!({ "item_on_top": s.item_on_top })).into_response(),
        "start" => match &s.start_message {
            Some(m) => Json(json!({ "message": m })).into_response(),
            None => Json(json!({})).into_response(),
        },
        "remove" => match &s.remove_message {
            Some(m) => Json(json!({ "message": m })).into_response(),
            None => StatusCode::OK.into_response(),
        },
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn send_results(
    State(state): State<Shared>,
    Path(xp): Path<String>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.lock().unwrap().submissions.push((xp, form));
    "OK".into_response()
}

async fn spawn_service(mock: MockService) -> (SocketAddr, Shared) {
    let state = Arc::new(Mutex::new(mock));
    let app = Router::new()
        .route("/user/login", post(login))
        .route("/queue/{verb}/{file}", post(queue_verb))
        .route("/xp/send_results/{xp}", post(send_results))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, state)
}

fn config(addr: SocketAddr, password: &str) -> Arc<ControlConfig> {
    Arc::new(ControlConfig {
        service_url: format!("http://{addr}/"),
        password: password.to_string(),
        rng_id: "7".to_string(),
        ..ControlConfig::default()
    })
}

fn clients(config: Arc<ControlConfig>) -> (Arc<SessionManager>, QueueClient) {
    let session = Arc::new(SessionManager::new(config).expect("session"));
    let queue = QueueClient::new(Arc::clone(&session));
    (session, queue)
}

// ============================================================================
// Session
// ============================================================================

#[tokio::test]
async fn login_stores_session_credential() {
    let (addr, state) = spawn_service(MockService::default()).await;
    let (session, _) = clients(config(addr, "hunter2"));

    assert!(!session.is_authenticated());
    session.login().await.expect("login");
    assert!(session.is_authenticated());
    assert!(session.credential().unwrap().contains("abc123"));

    let s = state.lock().unwrap();
    assert_eq!(s.logins.len(), 1);
    assert_eq!(s.logins[0]["email"], "control@chickenrand.org");
}

#[tokio::test]
async fn login_message_is_auth_failure() {
    let (addr, _) = spawn_service(MockService::default()).await;
    let (session, _) = clients(config(addr, "wrong"));

    let err = session.login().await.unwrap_err();
    assert!(err.is_auth(), "{err}");
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn unreachable_service_is_auth_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let (session, _) = clients(config(addr, "hunter2"));

    assert!(session.login().await.unwrap_err().is_auth());
}

#[tokio::test]
async fn truncated_login_response_is_auth_failure() {
    // Sets the cookie but closes before the advertised body arrives.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (mut tcp, _) = listener.accept().await.expect("accept");
        let mut buf = [0u8; 4096];
        let _ = tcp.read(&mut buf).await;
        let head = format!(
            "HTTP/1.1 200 OK\r\nSet-Cookie: {SESSION_COOKIE}; Path=/\r\n\
             Content-Type: application/json\r\nContent-Length: 100\r\n\r\n{{"
        );
        let _ = tcp.write_all(head.as_bytes()).await;
        let _ = tcp.shutdown().await;
    });
    let (session, _) = clients(config(addr, "hunter2"));

    let err = session.login().await.unwrap_err();
    assert!(err.is_auth(), "{err}");
}

// ============================================================================
// Queue verbs
// ============================================================================

#[tokio::test]
async fn admission_reports_slot_and_queue_length() {
    let (addr, state) = spawn_service(MockService {
        queue: vec![json!({ "id": 3 }), json!({ "id": 5 })],
        ..Default::default()
    })
    .await;
    let (session, queue) = clients(config(addr, "hunter2"));
    session.login().await.expect("login");

    let admission = queue.add("2").await.expect("add");
    assert_eq!(admission.queue_id, QueueId::new("5"));
    assert_eq!(admission.queue_length, 2);
    assert_eq!(state.lock().unwrap().paths, vec!["/queue/add/2.json"]);
}

#[tokio::test]
async fn unauthenticated_admission_is_auth_error() {
    let (addr, _) = spawn_service(MockService::default()).await;
    let (_, queue) = clients(config(addr, "hunter2"));

    let err = queue.add("2").await.unwrap_err();
    assert!(matches!(err, ControlError::Auth(_)), "{err}");
}

#[tokio::test]
async fn poll_compares_item_on_top() {
    let (addr, state) = spawn_service(MockService {
        item_on_top: Some(json!({ "id": 3 })),
        ..Default::default()
    })
    .await;
    let (session, queue) = clients(config(addr, "hunter2"));
    session.login().await.expect("login");
    let mine = QueueId::new("5");

    assert!(!queue.poll_position(&mine).await.unwrap());
    state.lock().unwrap().item_on_top = Some(json!({ "id": 5 }));
    assert!(queue.poll_position(&mine).await.unwrap());
    state.lock().unwrap().item_on_top = Some(json!("5"));
    assert!(queue.poll_position(&mine).await.unwrap());
    state.lock().unwrap().item_on_top = None;
    assert!(!queue.poll_position(&mine).await.unwrap());
}

#[tokio::test]
async fn start_refusal_is_protocol_error() {
    let (addr, _) = spawn_service(MockService {
        start_message: Some("Not your turn".to_string()),
        ..Default::default()
    })
    .await;
    let (session, queue) = clients(config(addr, "hunter2"));
    session.login().await.expect("login");

    let err = queue.start(&QueueId::new("5")).await.unwrap_err();
    assert!(err.is_queue_protocol(), "{err}");
}

#[tokio::test]
async fn remove_accepts_empty_body() {
    let (addr, state) = spawn_service(MockService::default()).await;
    let (session, queue) = clients(config(addr, "hunter2"));
    session.login().await.expect("login");

    queue.remove(&QueueId::new("5")).await.expect("remove");
    assert_eq!(state.lock().unwrap().paths, vec!["/queue/remove/5.json"]);
}

#[tokio::test]
async fn http_status_maps_to_error_kind() {
    let (addr, state) = spawn_service(MockService {
        force_status: Some(StatusCode::FORBIDDEN),
        ..Default::default()
    })
    .await;
    let (session, queue) = clients(config(addr, "hunter2"));
    session.login().await.expect("login");

    assert!(queue.start(&QueueId::new("5")).await.unwrap_err().is_auth());
    state.lock().unwrap().force_status = Some(StatusCode::INTERNAL_SERVER_ERROR);
    assert!(
        queue
            .start(&QueueId::new("5"))
            .await
            .unwrap_err()
            .is_queue_protocol()
    );
}

#[tokio::test]
async fn results_submitted_as_form_fields() {
    let (addr, state) = spawn_service(MockService::default()).await;
    let (session, queue) = clients(config(addr, "hunter2"));
    session.login().await.expect("login");

    let bundle = ResultsBundle {
        started_at: 1_700_000_000_000,
        is_control_run: true,
        trials: vec![TrialResult {
            ones_count: 9,
            zeros_count: 7,
            offset_ms: 100,
            numbers: Some(vec![0xFF, 0x01]),
            numbers_base64: None,
        }],
    };
    queue.submit_results("2", &bundle, "42").await.expect("submit");

    let s = state.lock().unwrap();
    assert_eq!(s.submissions.len(), 1);
    let (xp, form) = &s.submissions[0];
    assert_eq!(xp, "2");
    assert_eq!(form["rng_id"], "7");
    assert_eq!(form["rng_control_user_id"], "42");

    let results: Value = serde_json::from_str(&form["results"]).unwrap();
    assert_eq!(results["date"], 1_700_000_000_000u64);
    assert_eq!(results["isControlRun"], true);
    assert_eq!(results["trials"][0]["nbOnes"], 9);
    assert_eq!(results["trials"][0]["nbZeros"], 7);
    assert_eq!(results["trials"][0]["ms"], 100);
}

#[tokio::test]
async fn removing_unknown_slot_is_protocol_error() {
    let (addr, state) = spawn_service(MockService {
        remove_message: Some("No such item in queue".to_string()),
        ..Default::default()
    })
    .await;
    let (session, queue) = clients(config(addr, "hunter2"));
    session.login().await.expect("login");

    let err = queue.remove(&QueueId::new("404")).await.unwrap_err();
    assert!(err.is_queue_protocol(), "{err}");
    assert!(!err.is_auth());
    assert_eq!(state.lock().unwrap().paths, vec!["/queue/remove/404.json"]);
}
