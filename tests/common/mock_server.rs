//! Scriptable mock HTTP backend for exercising the agent end to end.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;

/// A request captured by the mock backend.
#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Clone, Default)]
struct ServerState {
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    /// Per-path queue of status codes returned before the default behavior.
    scripts: Arc<Mutex<HashMap<String, Vec<u16>>>>,
    rules_body: Arc<Mutex<serde_json::Value>>,
}

/// Mock backend bound to an ephemeral local port.
pub struct MockServer {
    pub addr: SocketAddr,
    state: ServerState,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = ServerState {
            rules_body: Arc::new(Mutex::new(serde_json::json!({ "version": 1 }))),
            ..Default::default()
        };

        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock server");
        let addr = listener.local_addr().expect("failed to read local addr");

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        MockServer { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Queues status codes for a path; once drained the path returns its
    /// default response again.
    pub fn script_responses(&self, path: &str, codes: &[u16]) {
        self.state
            .scripts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(codes);
    }

    /// Replaces the rule document served for `/rules` requests.
    pub fn set_rules(&self, rules: serde_json::Value) {
        *self.state.rules_body.lock().unwrap() = rules;
    }

    #[allow(dead_code)]
    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn requests_for_path(&self, path: &str) -> Vec<ReceivedRequest> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req.path == path)
            .cloned()
            .collect()
    }
}

async fn handle(
    State(state): State<ServerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();

    state.received.lock().unwrap().push(ReceivedRequest {
        method: method.to_string(),
        path: path.clone(),
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect(),
        body: body.to_vec(),
    });

    // Scripted responses take priority over the default behavior.
    let scripted = {
        let mut scripts = state.scripts.lock().unwrap();
        scripts.get_mut(&path).and_then(|queue| {
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        })
    };
    if let Some(code) = scripted {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, "scripted").into_response();
    }

    if path.ends_with("/rules") {
        let rules = state.rules_body.lock().unwrap().clone();
        let etag = rules
            .get("etag")
            .and_then(|v| v.as_str())
            .unwrap_or("v-default")
            .to_string();
        return ([("etag", etag)], axum::Json(rules)).into_response();
    }

    (StatusCode::OK, r#"{"ok":true}"#).into_response()
}
