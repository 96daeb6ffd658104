use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::lodestone::{
    identity::IdentityMap,
    net::Protocol,
    notify::{self, SharedSink},
    pending::PendingBuffer,
    persist::PlayerIpStore,
};

/// Collaborators of the control endpoint, owned by the orchestrator.
pub struct ControlState {
    pub identity: Arc<IdentityMap>,
    pub pending: Arc<PendingBuffer>,
    pub store: Arc<PlayerIpStore>,
    pub sink: SharedSink,
    /// Every distinct webhook URL from the listener rules; identity
    /// notifications broadcast to all of them.
    pub webhooks: Vec<String>,
}

#[derive(Debug, Error)]
enum BadRequest {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("field {0} has the wrong type")]
    WrongType(&'static str),
}

pub async fn serve(
    addr: SocketAddr,
    state: ControlState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind control endpoint {addr}"))?;
    tracing::info!(control_addr = %addr, "control: listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

fn router(state: Arc<ControlState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/players", get(players))
        .fallback(not_found)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Bodies are decoded by hand so every malformed input maps to a 400 with
/// an explanatory body, regardless of content type.
fn parse_event(body: &[u8]) -> Result<(i64, String), BadRequest> {
    let v: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| BadRequest::InvalidJson(e.to_string()))?;
    let obj = v.as_object().ok_or(BadRequest::WrongType("body"))?;

    let ts = obj
        .get("timestamp")
        .ok_or(BadRequest::MissingField("timestamp"))?;
    let ts = ts
        .as_i64()
        .or_else(|| ts.as_f64().map(|f| f as i64))
        .ok_or(BadRequest::WrongType("timestamp"))?;

    let username = obj
        .get("username")
        .ok_or(BadRequest::MissingField("username"))?
        .as_str()
        .ok_or(BadRequest::WrongType("username"))?;

    Ok((ts, username.to_string()))
}

async fn login(State(st): State<Arc<ControlState>>, body: Bytes) -> Response {
    let (ts, username) = match parse_event(&body) {
        Ok(v) => v,
        Err(e) => return bad_request(e),
    };

    st.identity.register_login(ts, &username);
    let (matched, unmatched) = st.pending.process_for_player(&username, ts);
    tracing::info!(
        username = %username,
        timestamp = ts,
        matched = matched.len(),
        still_pending = unmatched.len(),
        "control: login"
    );

    if matched.is_empty() {
        for url in &st.webhooks {
            st.sink.dispatch(url, notify::generic_login(&username));
        }
    } else {
        for flow in &matched {
            st.store
                .register(&username, &flow.ip.to_string(), flow.protocol)
                .await;
        }

        let mut groups: BTreeMap<(String, Protocol), Vec<u16>> = BTreeMap::new();
        for flow in &matched {
            groups
                .entry((flow.ip.to_string(), flow.protocol))
                .or_default()
                .push(flow.port);
        }
        for ((ip, protocol), mut ports) in groups {
            ports.sort_unstable();
            for url in &st.webhooks {
                st.sink
                    .dispatch(url, notify::identity_join(&username, &ip, &ports, protocol));
            }
        }
    }

    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "matched": matched.len() })),
    )
        .into_response()
}

async fn logout(State(st): State<Arc<ControlState>>, body: Bytes) -> Response {
    let (ts, username) = match parse_event(&body) {
        Ok(v) => v,
        Err(e) => return bad_request(e),
    };

    st.identity.register_logout(ts, &username);
    let ips = st.store.lookup(&username);
    tracing::info!(username = %username, timestamp = ts, known_ips = ips.len(), "control: logout");

    let embed = if ips.is_empty() {
        notify::generic_logout(&username)
    } else {
        notify::identity_leave(&username, &ips)
    };
    for url in &st.webhooks {
        st.sink.dispatch(url, embed.clone());
    }

    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

async fn players(State(st): State<Arc<ControlState>>) -> Response {
    (StatusCode::OK, Json(st.identity.snapshot())).into_response()
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not found" })),
    )
        .into_response()
}

fn bad_request(err: BadRequest) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lodestone::notify::testing::CollectingSink;
    use crate::lodestone::pending::PendingFlow;

    #[test]
    fn parse_event_accepts_numbers_and_strings() {
        let (ts, user) = parse_event(br#"{"timestamp": 1000, "username": "Steve"}"#).unwrap();
        assert_eq!((ts, user.as_str()), (1000, "Steve"));

        // Fractional timestamps truncate.
        let (ts, _) = parse_event(br#"{"timestamp": 1000.9, "username": "Steve"}"#).unwrap();
        assert_eq!(ts, 1000);
    }

    #[test]
    fn parse_event_rejects_bad_bodies() {
        assert!(matches!(
            parse_event(b"not json"),
            Err(BadRequest::InvalidJson(_))
        ));
        assert!(matches!(
            parse_event(br#"{"username": "Steve"}"#),
            Err(BadRequest::MissingField("timestamp"))
        ));
        assert!(matches!(
            parse_event(br#"{"timestamp": "1000", "username": "Steve"}"#),
            Err(BadRequest::WrongType("timestamp"))
        ));
        assert!(matches!(
            parse_event(br#"{"timestamp": 1000, "username": 5}"#),
            Err(BadRequest::WrongType("username"))
        ));
        assert!(matches!(
            parse_event(br#"[1, 2]"#),
            Err(BadRequest::WrongType("body"))
        ));
    }

    struct Rig {
        base: String,
        sink: Arc<CollectingSink>,
        identity: Arc<IdentityMap>,
        pending: Arc<PendingBuffer>,
        store: Arc<PlayerIpStore>,
        _stop: watch::Sender<bool>,
    }

    async fn rig() -> Rig {
        let sink = Arc::new(CollectingSink::default());
        let identity = Arc::new(IdentityMap::new());
        let pending = Arc::new(PendingBuffer::new());
        let store = Arc::new(
            PlayerIpStore::load(
                std::env::temp_dir().join(format!(
                    "lodestone-control-{}-{:p}.json",
                    std::process::id(),
                    &sink
                )),
                true,
            )
            .await,
        );

        let state = ControlState {
            identity: identity.clone(),
            pending: pending.clone(),
            store: store.clone(),
            sink: sink.clone(),
            webhooks: vec!["https://example.invalid/hook".into()],
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::new(state));
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await
                .unwrap();
        });

        Rig {
            base: format!("http://{addr}"),
            sink,
            identity,
            pending,
            store,
            _stop: tx,
        }
    }

    #[tokio::test]
    async fn login_correlates_pending_flow() {
        let rig = rig().await;
        let client = reqwest::Client::new();

        let _rx = rig.pending.insert(PendingFlow {
            ip: "198.51.100.7".parse().unwrap(),
            port: 40001,
            protocol: Protocol::Tcp,
            arrived_ms: 100_000,
            target: "127.0.0.1:9000".into(),
        });

        let resp = client
            .post(format!("{}/api/login", rig.base))
            .json(&json!({ "timestamp": 105_000, "username": "Steve" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .map(|v| v.to_str().unwrap()),
            Some("*")
        );

        assert!(rig.pending.is_empty());

        // Exactly one identity join to the configured webhook.
        let events = rig.sink.take();
        assert_eq!(events.len(), 1);
        let embed = &events[0].1;
        assert!(embed.description.as_deref().unwrap().contains("Steve"));
        assert_eq!(embed.fields[0].value, "198.51.100.7");

        // The address was persisted for the eventual logout.
        let ips = rig.store.lookup("Steve");
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].protocol, "tcp");
    }

    #[tokio::test]
    async fn login_without_pending_sends_generic_webhook() {
        let rig = rig().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/login", rig.base))
            .json(&json!({ "timestamp": 1_000, "username": "Alex" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let events = rig.sink.take();
        assert_eq!(events.len(), 1);
        assert!(events[0]
            .1
            .description
            .as_deref()
            .unwrap()
            .contains("logged in"));
        assert_eq!(rig.identity.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn logout_uses_stored_address() {
        let rig = rig().await;
        rig.store.register("Steve", "198.51.100.7", Protocol::Udp).await;
        rig.identity.register_login(1_000, "Steve");

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/api/logout", rig.base))
            .json(&json!({ "timestamp": 2_000, "username": "Steve" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        assert!(rig.identity.snapshot().is_empty());
        let events = rig.sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.fields[0].name, "198.51.100.7");
    }

    #[tokio::test]
    async fn malformed_body_is_400_and_unknown_route_404() {
        let rig = rig().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/login", rig.base))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("invalid json"));

        let resp = client
            .get(format!("{}/api/nope", rig.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn players_dump_lists_registered_logins() {
        let rig = rig().await;
        rig.identity.register_login(2_000, "Alex");
        rig.identity.register_login(1_000, "Steve");

        let resp = reqwest::get(format!("{}/api/players", rig.base))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        let list = body.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["username"], "Steve");
        assert_eq!(list[1]["username"], "Alex");
    }
}
